//! Execution of backend-initiated tunnel commands.
//!
//! Once a host is registered, the backend may push `RchClient` frames asking
//! the viewer to perform work on its behalf: liveness pings, a narrow set of
//! introspection expressions, and HTTP fetches from the viewer's vantage
//! point. Every command produces exactly one `RchResult` reply; failures are
//! reported as an empty payload so the backend can distinguish "no answer"
//! from "answered empty" only by its own timeout.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, warn};

/// A backend-initiated command lifted out of an `RchClient` frame.
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelCommand {
    pub request_id: String,
    pub url: String,
    pub body: String,
    pub headers: Vec<(String, String)>,
    pub want_response_headers: bool,
}

impl TunnelCommand {
    /// Parse the positional `args` of an `RchClient` frame. Missing trailing
    /// arguments take their defaults; a missing request id makes the frame
    /// unanswerable and yields `None`.
    pub fn from_args(args: &[Value]) -> Option<Self> {
        let request_id = args.first()?.as_str()?.to_string();
        let url = args
            .get(1)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let body = args
            .get(2)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let headers = args
            .get(3)
            .and_then(Value::as_object)
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        let want_response_headers = args.get(4).and_then(Value::as_bool).unwrap_or(false);
        Some(Self {
            request_id,
            url,
            body,
            headers,
            want_response_headers,
        })
    }
}

/// Executes tunnel commands. One per bridge connection; stateless apart from
/// the shared HTTP client.
pub struct CommandExecutor {
    http: reqwest::Client,
    timeout: Duration,
}

impl CommandExecutor {
    pub fn new(client_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("Failed to build HTTP client");
        Self {
            http,
            timeout: client_timeout,
        }
    }

    /// Run one command to completion and produce the reply payload.
    pub async fn execute(&self, cmd: &TunnelCommand) -> String {
        match cmd.url.as_str() {
            "ping" => "pong".to_string(),
            "eval" => evaluate_expression(&cmd.body),
            _ => self.relay_http(cmd).await,
        }
    }

    /// Fetch `cmd.url` from the viewer's network position. `POST` when a body
    /// was supplied, `GET` otherwise. Any failure collapses to an empty
    /// payload.
    async fn relay_http(&self, cmd: &TunnelCommand) -> String {
        let mut request = if cmd.body.is_empty() {
            self.http.get(&cmd.url)
        } else {
            self.http.post(&cmd.url).body(cmd.body.clone())
        };
        for (name, value) in &cmd.headers {
            request = request.header(name, value);
        }
        request = request.timeout(self.timeout);

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(url = %cmd.url, "Tunneled request failed: {e}");
                return String::new();
            }
        };

        let response_headers: Value = if cmd.want_response_headers {
            response
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_string(),
                        Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
                    )
                })
                .collect::<serde_json::Map<_, _>>()
                .into()
        } else {
            Value::Null
        };

        let body = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                warn!(url = %cmd.url, "Tunneled response body unreadable: {e}");
                return String::new();
            }
        };

        if cmd.want_response_headers {
            json!({ "headers": response_headers, "body": body }).to_string()
        } else {
            body
        }
    }
}

/// The backend's expression channel is deliberately narrow. Only expressions
/// with a known, side-effect-free meaning are answered.
fn evaluate_expression(expr: &str) -> String {
    match expr.trim() {
        "ping" | "'ping'" => "pong".to_string(),
        other => {
            debug!(expr = other, "Unrecognized tunnel expression");
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn ping_answers_pong() {
        let exec = CommandExecutor::new(Duration::from_secs(8));
        let cmd = TunnelCommand {
            request_id: "r1".into(),
            url: "ping".into(),
            body: String::new(),
            headers: vec![],
            want_response_headers: false,
        };
        assert_eq!(exec.execute(&cmd).await, "pong");
    }

    #[tokio::test]
    async fn unknown_expression_answers_empty() {
        let exec = CommandExecutor::new(Duration::from_secs(8));
        let cmd = TunnelCommand {
            request_id: "r1".into(),
            url: "eval".into(),
            body: "document.cookie".into(),
            headers: vec![],
            want_response_headers: false,
        };
        assert_eq!(exec.execute(&cmd).await, "");
    }

    #[test]
    fn frame_args_parse_with_defaults() {
        let args = vec![json!("r7"), json!("http://a/b")];
        let cmd = TunnelCommand::from_args(&args).unwrap();
        assert_eq!(cmd.request_id, "r7");
        assert_eq!(cmd.url, "http://a/b");
        assert_eq!(cmd.body, "");
        assert!(cmd.headers.is_empty());
        assert!(!cmd.want_response_headers);
    }

    #[test]
    fn frame_args_parse_headers_and_flag() {
        let args = vec![
            json!("r8"),
            json!("http://a/b"),
            json!("payload"),
            json!({"X-Key": "v"}),
            json!(true),
        ];
        let cmd = TunnelCommand::from_args(&args).unwrap();
        assert_eq!(cmd.headers, vec![("X-Key".to_string(), "v".to_string())]);
        assert!(cmd.want_response_headers);
    }

    #[test]
    fn frame_without_request_id_is_unanswerable() {
        assert_eq!(TunnelCommand::from_args(&[]), None);
        assert_eq!(TunnelCommand::from_args(&[json!(42)]), None);
    }
}
