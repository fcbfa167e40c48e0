//! Outbound request dispatch.
//!
//! Every backend request flows through [`RequestDispatcher`]: the URL is
//! canonicalized with the viewer's identity parameters, checked against the
//! storm guard, and only then sent. Suppression is an outcome the caller can
//! observe, not an error.

use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{AuthConfig, DispatchConfig};
use crate::error::EngineError;

/// Result of a dispatch attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Completed(T),
    /// The storm guard refused the dispatch. Not an error; the caller shows
    /// nothing and the viewer retries naturally.
    Suppressed,
}

impl<T> Outcome<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            Outcome::Completed(v) => Some(v),
            Outcome::Suppressed => None,
        }
    }
}

/// A backend reply demanding that the request be retried through the tunnel.
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelSentinel {
    /// Socket URL the backend wants the bridge opened against, when it names
    /// one. Absent means "use the default bridge endpoint for this host".
    pub socket_url: Option<String>,
}

/// Detect the tunnel sentinel on a JSON reply.
pub fn tunnel_sentinel(value: &Value) -> Option<TunnelSentinel> {
    let rch = value.get("rch")?;
    if rch.is_null() || rch == &Value::Bool(false) {
        return None;
    }
    Some(TunnelSentinel {
        socket_url: value
            .get("nws")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

/// Detect the terminal account-error marker on a JSON reply. Returns the
/// backend's user-facing message.
pub fn account_error(value: &Value) -> Option<String> {
    let accsdb = value.get("accsdb")?;
    if accsdb.is_null() || accsdb == &Value::Bool(false) {
        return None;
    }
    Some(
        value
            .get("msg")
            .and_then(Value::as_str)
            .unwrap_or("Account error")
            .to_string(),
    )
}

struct StormState {
    count: u32,
    last_dispatch: Option<Instant>,
}

/// Canonicalizes, storm-guards, and sends backend requests.
pub struct RequestDispatcher {
    http: reqwest::Client,
    auth: AuthConfig,
    config: DispatchConfig,
    storm: Mutex<StormState>,
}

impl RequestDispatcher {
    pub fn new(auth: AuthConfig, config: DispatchConfig) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("Failed to build HTTP client");
        Self {
            http,
            auth,
            config,
            storm: Mutex::new(StormState {
                count: 0,
                last_dispatch: None,
            }),
        }
    }

    /// Append the viewer's identity parameters when the URL does not already
    /// carry them. Idempotent.
    pub fn canonicalize(&self, url: &str) -> String {
        let mut out = url.to_string();
        append_param_if_absent(&mut out, "uid", &self.auth.unic_id);
        append_param_if_absent(&mut out, "device_id", &self.auth.device_id);
        if !self.auth.token.is_empty() {
            append_param_if_absent(&mut out, "token", &self.auth.token);
        }
        out
    }

    /// Register one dispatch with the storm guard. The count resets once
    /// `storm_window_ms` has passed since the last *admitted* dispatch;
    /// suppressed dispatches do not refresh the window, so a steady retry
    /// loop recovers as soon as the window elapses.
    fn storm_check(&self) -> bool {
        let mut storm = self.storm.lock().expect("storm lock");
        let now = Instant::now();
        if let Some(last) = storm.last_dispatch {
            if now.duration_since(last) >= Duration::from_millis(self.config.storm_window_ms) {
                storm.count = 0;
            }
        }
        if storm.count >= self.config.storm_limit {
            warn!(count = storm.count, "Dispatch suppressed by storm guard");
            return false;
        }
        storm.count += 1;
        storm.last_dispatch = Some(now);
        true
    }

    /// GET the URL and return the response body as text.
    pub async fn send_text(&self, url: &str) -> Result<Outcome<String>, EngineError> {
        self.send_text_with_timeout(url, Duration::from_millis(self.config.timeout_ms))
            .await
    }

    /// GET the URL with an explicit timeout and return the body as text.
    pub async fn send_text_with_timeout(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<Outcome<String>, EngineError> {
        let url = self.canonicalize(url);
        if !self.storm_check() {
            return Ok(Outcome::Suppressed);
        }
        debug!(url = %url, "Dispatching");
        let response = self.http.get(&url).timeout(timeout).send().await?;
        let body = response.text().await?;
        Ok(Outcome::Completed(body))
    }

    /// GET the URL and parse the response body as JSON.
    pub async fn send_json(&self, url: &str) -> Result<Outcome<Value>, EngineError> {
        self.send_json_with_timeout(url, Duration::from_millis(self.config.timeout_ms))
            .await
    }

    /// GET the URL with an explicit timeout and parse the body as JSON.
    pub async fn send_json_with_timeout(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<Outcome<Value>, EngineError> {
        match self.send_text_with_timeout(url, timeout).await? {
            Outcome::Suppressed => Ok(Outcome::Suppressed),
            Outcome::Completed(text) => {
                let value = serde_json::from_str(&text)
                    .map_err(|e| EngineError::Parse(format!("invalid JSON reply: {e}")))?;
                Ok(Outcome::Completed(value))
            }
        }
    }
}

fn has_param(url: &str, name: &str) -> bool {
    let Some(query) = url.split_once('?').map(|(_, q)| q) else {
        return false;
    };
    query
        .split('&')
        .any(|pair| pair == name || pair.starts_with(&format!("{name}=")))
}

fn append_param_if_absent(url: &mut String, name: &str, value: &str) {
    if has_param(url, name) {
        return;
    }
    let sep = if url.contains('?') { '&' } else { '?' };
    url.push(sep);
    url.push_str(name);
    url.push('=');
    url.push_str(&urlencode(value));
}

/// Percent-encode a query value. Unreserved characters pass through.
pub(crate) fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            other => {
                out.push_str(&format!("%{other:02X}"));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dispatcher(limit: u32, window_ms: u64) -> RequestDispatcher {
        RequestDispatcher::new(
            AuthConfig {
                unic_id: "guest".into(),
                device_id: "dev-1".into(),
                token: "t0k".into(),
                profile_id: String::new(),
                player: "inner".into(),
            },
            DispatchConfig {
                timeout_ms: 15000,
                storm_limit: limit,
                storm_window_ms: window_ms,
            },
        )
    }

    #[test]
    fn canonicalize_appends_identity() {
        let d = dispatcher(10, 4000);
        assert_eq!(
            d.canonicalize("http://b/lite/events?life=true"),
            "http://b/lite/events?life=true&uid=guest&device_id=dev-1&token=t0k"
        );
    }

    #[test]
    fn canonicalize_is_idempotent() {
        let d = dispatcher(10, 4000);
        let once = d.canonicalize("http://b/lite/events");
        assert_eq!(d.canonicalize(&once), once);
    }

    #[test]
    fn canonicalize_keeps_existing_uid() {
        let d = dispatcher(10, 4000);
        let url = d.canonicalize("http://b/x?uid=other");
        assert!(url.contains("uid=other"));
        assert!(!url.contains("uid=guest"));
    }

    #[test]
    fn canonicalize_skips_token_when_unset() {
        let mut d = dispatcher(10, 4000);
        d.auth.token = String::new();
        assert!(!d.canonicalize("http://b/x").contains("token="));
    }

    #[test]
    fn urlencode_escapes_reserved() {
        assert_eq!(urlencode("a b&c"), "a%20b%26c");
        assert_eq!(urlencode("plain-value_1.x~"), "plain-value_1.x~");
    }

    #[tokio::test(start_paused = true)]
    async fn storm_guard_allows_limit_then_suppresses() {
        let d = dispatcher(10, 4000);
        for _ in 0..10 {
            assert!(d.storm_check());
        }
        assert!(!d.storm_check());
        assert!(!d.storm_check());
    }

    #[tokio::test(start_paused = true)]
    async fn storm_guard_resets_after_quiet_gap() {
        let d = dispatcher(10, 4000);
        for _ in 0..11 {
            d.storm_check();
        }
        assert!(!d.storm_check());
        tokio::time::advance(Duration::from_millis(4001)).await;
        assert!(d.storm_check());
    }

    #[tokio::test(start_paused = true)]
    async fn suppressed_retries_recover_after_window() {
        let d = dispatcher(10, 4000);
        for _ in 0..10 {
            assert!(d.storm_check());
        }
        tokio::time::advance(Duration::from_millis(2000)).await;
        assert!(!d.storm_check());
        tokio::time::advance(Duration::from_millis(2000)).await;
        // 4 s since the last admitted dispatch; the suppressed retry above
        // must not have extended the window.
        assert!(d.storm_check());
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_dispatches_within_window_do_not_reset() {
        let d = dispatcher(10, 4000);
        for _ in 0..10 {
            assert!(d.storm_check());
            tokio::time::advance(Duration::from_millis(500)).await;
        }
        // Each gap was under the window, so the counter never reset.
        assert!(!d.storm_check());
    }

    #[test]
    fn tunnel_sentinel_detected() {
        let v = json!({"rch": true, "nws": "ws://b/ws"});
        assert_eq!(
            tunnel_sentinel(&v),
            Some(TunnelSentinel {
                socket_url: Some("ws://b/ws".into())
            })
        );
        assert_eq!(tunnel_sentinel(&json!({"ok": true})), None);
        assert_eq!(tunnel_sentinel(&json!({"rch": false})), None);
    }

    #[test]
    fn account_error_detected() {
        let v = json!({"accsdb": true, "msg": "expired"});
        assert_eq!(account_error(&v).as_deref(), Some("expired"));
        assert_eq!(
            account_error(&json!({"accsdb": true})).as_deref(),
            Some("Account error")
        );
        assert_eq!(account_error(&json!({"ok": true})), None);
    }
}
