//! Top-level resolution engine.
//!
//! [`Engine`] wires the dispatcher, probe, bridge, and discovery poller into
//! the three operations the host application drives:
//!
//! | Operation            | What it does                                          |
//! |----------------------|-------------------------------------------------------|
//! | `fetch_with_tunnel`  | Backend GET, opening the bridge and retrying once when |
//! |                      | the reply demands a tunnel                             |
//! | `discover_sources`   | Full discovery session plus active-source selection    |
//! | `search_capable`     | Memoized list of balancers that support search         |

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bridge::BridgeClient;
use crate::config::Config;
use crate::discovery::{
    select_active, SnapshotObserver, SourceDiscoveryPoller, SourceSet,
};
use crate::dispatch::{account_error, tunnel_sentinel, Outcome, RequestDispatcher};
use crate::error::EngineError;
use crate::probe::TransportProbe;
use crate::query::MediaQuery;
use crate::registry::HostRegistry;
use crate::storage::{ChoiceStore, Storage};

const SEARCH_CAPABLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of a discovery session: the visible sources and the one selected
/// for playback.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSources {
    pub sources: SourceSet,
    pub active: String,
}

pub struct Engine {
    config: Config,
    registry: Arc<HostRegistry>,
    dispatcher: Arc<RequestDispatcher>,
    bridge: BridgeClient,
    poller: SourceDiscoveryPoller<Arc<RequestDispatcher>>,
    storage: Arc<dyn Storage>,
    search_capable: OnceCell<Vec<String>>,
}

impl Engine {
    pub fn new(config: Config, storage: Arc<dyn Storage>) -> Self {
        let registry = Arc::new(HostRegistry::new());
        let own_host = std::env::var("HOSTNAME").unwrap_or_default();
        let probe = Arc::new(TransportProbe::new(
            Arc::clone(&registry),
            config.platform.resolve(),
            own_host,
        ));
        let dispatcher = Arc::new(RequestDispatcher::new(
            config.auth.clone(),
            config.dispatch.clone(),
        ));
        let bridge = BridgeClient::new(
            Arc::clone(&registry),
            probe,
            config.bridge.clone(),
            config.auth.clone(),
        );
        let poller =
            SourceDiscoveryPoller::new(Arc::clone(&dispatcher), config.discovery.clone());
        Self {
            config,
            registry,
            dispatcher,
            bridge,
            poller,
            storage,
            search_capable: OnceCell::new(),
        }
    }

    pub fn registry(&self) -> &Arc<HostRegistry> {
        &self.registry
    }

    fn server_url(&self) -> Result<String, EngineError> {
        self.config
            .backend
            .server_url()
            .ok_or(EngineError::NotConfigured)
    }

    fn host_key(&self) -> Result<String, EngineError> {
        self.config
            .backend
            .host_key()
            .ok_or(EngineError::NotConfigured)
    }

    /// GET a backend URL, transparently satisfying a tunnel demand.
    ///
    /// When the reply carries the tunnel sentinel, the bridge is connected
    /// and registered for this host and the request retried once. A sentinel
    /// on the retry means the tunnel did not come up in time.
    pub async fn fetch_with_tunnel(&self, url: &str) -> Result<Outcome<Value>, EngineError> {
        let server_url = self.server_url()?;
        let host_key = self.host_key()?;

        let reply = match self.dispatcher.send_json(url).await? {
            Outcome::Completed(reply) => reply,
            Outcome::Suppressed => return Ok(Outcome::Suppressed),
        };
        if let Some(message) = account_error(&reply) {
            return Err(EngineError::Account { message });
        }
        let Some(sentinel) = tunnel_sentinel(&reply) else {
            return Ok(Outcome::Completed(reply));
        };

        debug!(url, "Reply demands a tunnel, connecting bridge");
        let ws_url = sentinel
            .socket_url
            .unwrap_or_else(|| default_ws_url(&server_url));
        self.bridge
            .connect(&host_key, &ws_url, &server_url)
            .await
            .map_err(|e| {
                warn!("Bridge connect failed: {e}");
                EngineError::Tunnel
            })?;

        let retry = match self.dispatcher.send_json(url).await? {
            Outcome::Completed(reply) => reply,
            Outcome::Suppressed => return Ok(Outcome::Suppressed),
        };
        if let Some(message) = account_error(&retry) {
            return Err(EngineError::Account { message });
        }
        if tunnel_sentinel(&retry).is_some() {
            return Err(EngineError::Tunnel);
        }
        Ok(Outcome::Completed(retry))
    }

    /// Run a discovery session for one title and select the active source.
    ///
    /// `explicit` forces a source (the viewer picked one); otherwise the
    /// per-movie last choice and the global default apply. The selection is
    /// persisted so the next session prefers it.
    pub async fn discover_sources(
        &self,
        query: &MediaQuery,
        explicit: Option<&str>,
        cancel: &CancellationToken,
        observer: Option<SnapshotObserver>,
    ) -> Result<Outcome<ResolvedSources>, EngineError> {
        let server_url = self.server_url()?;
        let host_key = self.host_key()?;
        let movie_id = query.id.to_string();

        let rchtype = self
            .registry
            .entry(&host_key)
            .transport_type()
            .map_or("", |t| t.as_str());
        let start_url = query.append_to(&format!("{server_url}/lite/events?life=true"), rchtype);

        let choices = ChoiceStore::new(self.storage.as_ref());
        let preferred = choices.last_source(&movie_id);

        let set = match self
            .poller
            .discover(&start_url, preferred.as_deref(), cancel, observer)
            .await?
        {
            Outcome::Completed(set) => set,
            Outcome::Suppressed => return Ok(Outcome::Suppressed),
        };

        let default_source = choices.default_source();
        let Some(active) = select_active(
            &set,
            preferred.as_deref(),
            default_source.as_deref(),
            explicit,
        ) else {
            return Err(EngineError::NoSources);
        };
        choices.set_active_source(&active);
        choices.set_last_source(&movie_id, &active);

        Ok(Outcome::Completed(ResolvedSources {
            sources: set,
            active,
        }))
    }

    /// Balancer keys that support text search on this backend. Fetched once
    /// per process; any failure memoizes an empty list.
    pub async fn search_capable(&self) -> &[String] {
        self.search_capable
            .get_or_init(|| async {
                let Ok(server_url) = self.server_url() else {
                    return Vec::new();
                };
                let url = format!("{server_url}/lite/withsearch");
                match self
                    .dispatcher
                    .send_json_with_timeout(&url, SEARCH_CAPABLE_TIMEOUT)
                    .await
                {
                    Ok(Outcome::Completed(Value::Array(entries))) => entries
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect(),
                    Ok(_) => Vec::new(),
                    Err(e) => {
                        warn!("Search-capable list fetch failed: {e}");
                        Vec::new()
                    }
                }
            })
            .await
    }
}

/// Default bridge endpoint for a backend: same authority, `ws` scheme, `/ws`.
fn default_ws_url(server_url: &str) -> String {
    let ws_base = if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{server_url}")
    };
    format!("{ws_base}/ws")
}
