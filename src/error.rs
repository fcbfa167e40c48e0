//! Error taxonomy for the resolution engine.
//!
//! Only a handful of failures escalate to the caller: a missing backend
//! configuration, an exhausted discovery session, a terminal account error,
//! and a tunnel that failed to materialize. Probe failures degrade the
//! transport type instead of erroring, storm suppression is an outcome, and
//! individual tunneled-command failures are swallowed into empty results.

use std::fmt;

/// Errors surfaced by the engine's public operations.
#[derive(Debug)]
pub enum EngineError {
    /// No backend server is configured. Not retryable — the user must
    /// configure one first.
    NotConfigured,
    /// Discovery terminated without any eligible source.
    NoSources,
    /// The backend reported a terminal account/billing error. Never retried
    /// automatically; carries the backend's user-facing message.
    Account { message: String },
    /// The response demanded a tunnel but the tunnel could not satisfy the
    /// retried request.
    Tunnel,
    /// HTTP transport failure (connection refused, timeout, DNS, bad status).
    Http(reqwest::Error),
    /// The response body could not be interpreted.
    Parse(String),
}

impl EngineError {
    /// Whether this error should feed the failover countdown's longer
    /// account-error variant.
    pub fn is_account(&self) -> bool {
        matches!(self, EngineError::Account { .. })
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::NotConfigured => write!(f, "No backend server configured"),
            EngineError::NoSources => write!(f, "Backend returned no playable sources"),
            EngineError::Account { message } => write!(f, "Account error: {message}"),
            EngineError::Tunnel => write!(f, "Tunnel request could not be satisfied"),
            EngineError::Http(e) => write!(f, "HTTP request failed: {e}"),
            EngineError::Parse(msg) => write!(f, "Unusable response: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        EngineError::Http(e)
    }
}

/// Errors from bridge connection establishment.
#[derive(Debug)]
pub enum BridgeError {
    /// No host key — bridge cannot exist without a configured backend.
    NotConfigured,
    /// WebSocket connect failure.
    Connect(String),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::NotConfigured => write!(f, "No backend server configured"),
            BridgeError::Connect(msg) => write!(f, "Bridge connect failed: {msg}"),
        }
    }
}

impl std::error::Error for BridgeError {}
