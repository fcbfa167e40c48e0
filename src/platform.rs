//! Runtime platform classification.

use std::fmt;

/// The kind of runtime the viewer is executing on. Resolved once at startup
/// from configuration and injected wherever transport negotiation needs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// Mobile OS build — requests route through the native app shell.
    Mobile,
    /// Constrained TV runtime — CORS requests are always permitted.
    Tv,
    /// Anything else (desktop browser, embedded webview).
    Generic,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Platform::Mobile => "mobile",
            Platform::Tv => "tv",
            Platform::Generic => "generic",
        };
        write!(f, "{s}")
    }
}
