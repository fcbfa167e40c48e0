//! WebSocket bridge between the backend and the viewer.
//!
//! [`BridgeClient`] keeps at most one live connection per host key. A
//! connection is established lazily when a backend response demands a tunnel,
//! performs the `RchRegistry` handshake, and then serves backend-initiated
//! commands until the socket drops or the session is torn down. There is no
//! auto-reconnect; the next tunnel demand opens a fresh connection.
//!
//! Wire framing is text JSON, one object per frame:
//!
//! ```json
//! {"method": "RchClient", "args": ["<request-id>", "<url>", "<body>", {"H": "v"}, false]}
//! ```
//!
//! Methods: `RchRegistry` (handshake, both directions), `RchClient`
//! (backend-initiated command), `RchResult` (our reply), `Connected`
//! (backend reports the tunnel connection id).

pub mod executor;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AuthConfig, BridgeConfig};
use crate::error::BridgeError;
use crate::probe::TransportProbe;
use crate::registry::{HostEntry, HostRegistry};

use executor::{CommandExecutor, TunnelCommand};

/// Build an outbound frame.
fn frame(method: &str, args: Vec<Value>) -> Value {
    json!({ "method": method, "args": args })
}

/// One live bridge socket. Cheap to clone through the `Arc` held by
/// [`BridgeClient`]; dropping the last handle does not close the socket,
/// teardown goes through the cancellation token.
pub struct BridgeConnection {
    sender: mpsc::Sender<Value>,
    alive: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl BridgeConnection {
    /// Whether the io loop still owns an open socket.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Queue an outbound frame. Errors only when the io loop has exited.
    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<(), BridgeError> {
        self.sender
            .send(frame(method, args))
            .await
            .map_err(|_| BridgeError::Connect("bridge sender closed".to_string()))
    }

    /// Tear the connection down. Idempotent.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Per-host bridge connection manager.
pub struct BridgeClient {
    registry: Arc<HostRegistry>,
    probe: Arc<TransportProbe>,
    bridge: BridgeConfig,
    auth: AuthConfig,
    connections: Mutex<HashMap<String, Arc<BridgeConnection>>>,
}

impl BridgeClient {
    pub fn new(
        registry: Arc<HostRegistry>,
        probe: Arc<TransportProbe>,
        bridge: BridgeConfig,
        auth: AuthConfig,
    ) -> Self {
        Self {
            registry,
            probe,
            bridge,
            auth,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Connect (or reuse) the bridge for a host and run the registry
    /// handshake. Returns once the connection is ready to serve tunnel
    /// traffic, including the degraded case where the handshake ack never
    /// arrived.
    pub async fn connect(
        &self,
        host_key: &str,
        ws_url: &str,
        origin: &str,
    ) -> Result<Arc<BridgeConnection>, BridgeError> {
        if host_key.is_empty() {
            return Err(BridgeError::NotConfigured);
        }

        // Lock only for the map lookups; holding it across the connect and
        // handshake would stall every other host behind one slow backend.
        {
            let mut connections = self.connections.lock().await;
            if let Some(existing) = connections.get(host_key) {
                if existing.is_alive() {
                    debug!(host = host_key, "Reusing live bridge connection");
                    return Ok(Arc::clone(existing));
                }
                existing.shutdown();
                connections.remove(host_key);
            }
        }

        let transport = self.probe.resolve_type(host_key, origin).await;
        let entry = self.registry.entry(host_key);

        let (ws_stream, _) = tokio_tungstenite::connect_async(ws_url)
            .await
            .map_err(|e| BridgeError::Connect(e.to_string()))?;

        let (out_tx, out_rx) = mpsc::channel::<Value>(64);
        let alive = Arc::new(AtomicBool::new(true));
        let registered_ack = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        let executor = CommandExecutor::new(Duration::from_millis(self.bridge.client_timeout_ms));
        tokio::spawn(io_loop(
            ws_stream,
            out_rx,
            out_tx.clone(),
            Arc::clone(&entry),
            executor,
            Arc::clone(&alive),
            Arc::clone(&registered_ack),
            cancel.clone(),
            host_key.to_string(),
        ));

        let connection = Arc::new(BridgeConnection {
            sender: out_tx,
            alive,
            cancel,
        });

        let payload = json!({
            "version": self.bridge.registry_version,
            "host": host_key,
            "rchtype": transport.as_str(),
            "apkVersion": entry.apk_version.load(Ordering::SeqCst),
            "player": self.auth.player,
            "account_email": "",
            "unic_id": self.auth.unic_id,
            "profile_id": self.auth.profile_id,
            "token": self.auth.token,
        })
        .to_string();

        // Arm the ack waiter before the handshake goes out so an immediate
        // ack cannot slip past it.
        let ack = registered_ack.notified();
        tokio::pin!(ack);
        ack.as_mut().enable();

        connection
            .invoke("RchRegistry", vec![Value::String(payload)])
            .await?;

        if entry.is_registered() {
            // Reconnect of a known host. The backend already holds the
            // registration; waiting for another ack would stall playback.
            debug!(host = host_key, "Host already registered, skipping handshake wait");
        } else {
            let wait = tokio::time::timeout(
                Duration::from_millis(self.bridge.handshake_timeout_ms),
                ack,
            )
            .await;
            match wait {
                Ok(()) => {
                    entry.mark_registered();
                    info!(host = host_key, transport = transport.as_str(), "Bridge registered");
                }
                Err(_) => {
                    warn!(host = host_key, "Registry handshake ack timed out, proceeding degraded");
                }
            }
        }

        let mut connections = self.connections.lock().await;
        if let Some(racer) = connections.get(host_key) {
            if racer.is_alive() {
                // Another caller connected this host while we handshook.
                connection.shutdown();
                return Ok(Arc::clone(racer));
            }
        }
        connections.insert(host_key.to_string(), Arc::clone(&connection));
        Ok(connection)
    }

    /// Shut down the bridge for one host, if any.
    pub async fn disconnect(&self, host_key: &str) {
        if let Some(connection) = self.connections.lock().await.remove(host_key) {
            connection.shutdown();
        }
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Owns the socket: writes queued outbound frames, parses inbound frames and
/// dispatches them. Exits on socket close, cancellation, or sender drop.
#[allow(clippy::too_many_arguments)]
async fn io_loop(
    ws_stream: WsStream,
    mut out_rx: mpsc::Receiver<Value>,
    out_tx: mpsc::Sender<Value>,
    entry: Arc<HostEntry>,
    executor: CommandExecutor,
    alive: Arc<AtomicBool>,
    registered_ack: Arc<Notify>,
    cancel: CancellationToken,
    host_key: String,
) {
    let (mut ws_sink, mut ws_reader) = ws_stream.split();
    let executor = Arc::new(executor);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = ws_sink.close().await;
                break;
            }
            msg = ws_reader.next() => {
                match msg {
                    Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                        if let Ok(parsed) = serde_json::from_str::<Value>(&text) {
                            handle_frame(&parsed, &entry, &executor, &out_tx, &registered_ack, &host_key);
                        }
                    }
                    Some(Ok(tokio_tungstenite::tungstenite::Message::Close(_))) | None => {
                        info!(host = %host_key, "Bridge socket closed");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(host = %host_key, "Bridge socket error: {e}");
                        break;
                    }
                    _ => {} // Binary/Ping/Pong
                }
            }
            msg = out_rx.recv() => {
                match msg {
                    Some(value) => {
                        let text = serde_json::to_string(&value).unwrap_or_default();
                        if ws_sink.send(tokio_tungstenite::tungstenite::Message::Text(text)).await.is_err() {
                            warn!(host = %host_key, "Bridge send failed");
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    alive.store(false, Ordering::SeqCst);
}

/// Dispatch one inbound frame.
fn handle_frame(
    msg: &Value,
    entry: &Arc<HostEntry>,
    executor: &Arc<CommandExecutor>,
    out_tx: &mpsc::Sender<Value>,
    registered_ack: &Arc<Notify>,
    host_key: &str,
) {
    let method = msg["method"].as_str().unwrap_or("");
    let args = msg["args"].as_array().cloned().unwrap_or_default();

    match method {
        "RchRegistry" => {
            registered_ack.notify_waiters();
        }
        "RchClient" => {
            let Some(cmd) = TunnelCommand::from_args(&args) else {
                warn!(host = host_key, "Unanswerable RchClient frame");
                return;
            };
            // Commands run concurrently; the backend correlates replies by
            // request id, not by order.
            let executor = Arc::clone(executor);
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                let payload = executor.execute(&cmd).await;
                let reply = frame(
                    "RchResult",
                    vec![Value::String(cmd.request_id), Value::String(payload)],
                );
                let _ = out_tx.send(reply).await;
            });
        }
        "Connected" => {
            if let Some(id) = args.first().and_then(Value::as_str) {
                entry.set_connection_id(id.to_string());
                debug!(host = host_key, connection_id = id, "Tunnel connection id recorded");
            }
        }
        other => {
            debug!(host = host_key, method = other, "Ignoring unknown bridge frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_serialize_method_and_args() {
        let f = frame("RchResult", vec![json!("r1"), json!("pong")]);
        assert_eq!(
            serde_json::to_string(&f).unwrap(),
            r#"{"args":["r1","pong"],"method":"RchResult"}"#
        );
    }

    #[tokio::test]
    async fn empty_host_key_is_not_configured() {
        let registry = Arc::new(HostRegistry::new());
        let probe = Arc::new(TransportProbe::new(
            Arc::clone(&registry),
            crate::platform::Platform::Tv,
            String::new(),
        ));
        let client = BridgeClient::new(
            registry,
            probe,
            BridgeConfig::default(),
            AuthConfig::default(),
        );
        let result = client.connect("", "ws://x", "http://x").await;
        assert!(matches!(result, Err(BridgeError::NotConfigured)));
    }

    #[tokio::test]
    async fn live_connection_is_reused_without_reconnecting() {
        let registry = Arc::new(HostRegistry::new());
        let probe = Arc::new(TransportProbe::new(
            Arc::clone(&registry),
            crate::platform::Platform::Tv,
            String::new(),
        ));
        let client = BridgeClient::new(
            registry,
            probe,
            BridgeConfig::default(),
            AuthConfig::default(),
        );

        let (sender, _keep_rx) = mpsc::channel(1);
        let existing = Arc::new(BridgeConnection {
            sender,
            alive: Arc::new(AtomicBool::new(true)),
            cancel: CancellationToken::new(),
        });
        client
            .connections
            .lock()
            .await
            .insert("h.example.com".to_string(), Arc::clone(&existing));

        // Reuse must short-circuit before any socket work; the endpoint is
        // unreachable on purpose.
        let got = client
            .connect("h.example.com", "ws://h.invalid/ws", "http://h.example.com")
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&got, &existing));
    }

    #[test]
    fn connected_frame_records_connection_id() {
        let registry = HostRegistry::new();
        let entry = registry.entry("h");
        let (tx, _rx) = mpsc::channel(1);
        let executor = Arc::new(CommandExecutor::new(Duration::from_secs(1)));
        let ack = Arc::new(Notify::new());
        handle_frame(
            &json!({"method": "Connected", "args": ["conn-9"]}),
            &entry,
            &executor,
            &tx,
            &ack,
            "h",
        );
        assert_eq!(entry.connection_id().as_deref(), Some("conn-9"));
    }
}
