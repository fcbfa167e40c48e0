//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `SRCBRIDGE_SERVER`, `SRCBRIDGE_TOKEN`,
//!    `SRCBRIDGE_DEVICE_ID`
//! 2. **Config file** — path via `--config <path>`, or `srcbridge.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [backend]
//! servers = ["http://lamp.example.com", "backup.example.com:9118"]
//! active = 0
//!
//! [auth]
//! unic_id = "guest"
//! device_id = ""        # generated UUID v4 when empty
//! token = ""
//! profile_id = ""
//! player = "inner"
//!
//! [bridge]
//! registry_version = 149
//! client_timeout_ms = 8000
//! handshake_timeout_ms = 10000
//!
//! [discovery]
//! start_timeout_ms = 15000
//! poll_interval_ms = 1000
//! poll_timeout_ms = 3000
//! max_attempts = 15
//!
//! [dispatch]
//! timeout_ms = 15000
//! storm_limit = 10
//! storm_window_ms = 4000
//!
//! [platform]
//! kind = "generic"      # generic | mobile | tv
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

use crate::platform::Platform;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub platform: PlatformConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Backend server list and active selection.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendConfig {
    /// Configured backend URLs. Scheme is optional — `http://` is assumed.
    #[serde(default)]
    pub servers: Vec<String>,
    /// Index into `servers` of the active backend. Out of range falls back to 0.
    #[serde(default)]
    pub active: usize,
}

impl BackendConfig {
    /// Normalized URL of the active backend, or `None` when nothing is
    /// configured. Trailing slashes are stripped and a missing scheme
    /// defaults to `http://`.
    pub fn server_url(&self) -> Option<String> {
        if self.servers.is_empty() {
            return None;
        }
        let index = if self.active < self.servers.len() {
            self.active
        } else {
            0
        };
        let raw = self.servers[index].trim().trim_end_matches('/');
        if raw.is_empty() {
            return None;
        }
        if raw.starts_with("http://") || raw.starts_with("https://") {
            Some(raw.to_string())
        } else {
            Some(format!("http://{raw}"))
        }
    }

    /// Backend identity used to key per-host state: the URL minus its scheme.
    pub fn host_key(&self) -> Option<String> {
        self.server_url().map(|url| {
            url.trim_start_matches("https://")
                .trim_start_matches("http://")
                .to_string()
        })
    }

    /// Whether any backend is configured.
    pub fn is_configured(&self) -> bool {
        self.server_url().is_some()
    }
}

/// Identity and credentials attached to every backend request.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Stable per-install unique id sent as `uid`. Defaults to `"guest"`.
    #[serde(default = "default_unic_id")]
    pub unic_id: String,
    /// Stable per-install device identifier sent as `device_id`.
    /// Generated (UUID v4) when left empty. Override with `SRCBRIDGE_DEVICE_ID`.
    #[serde(default)]
    pub device_id: String,
    /// Auth token appended as `token` when non-empty. Override with `SRCBRIDGE_TOKEN`.
    #[serde(default)]
    pub token: String,
    /// Optional profile id included in the registry handshake.
    #[serde(default)]
    pub profile_id: String,
    /// Player-mode preference reported in the registry handshake.
    #[serde(default = "default_player")]
    pub player: String,
}

/// Bridge connection and handshake settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Protocol version sent in the `RchRegistry` handshake (default 149).
    #[serde(default = "default_registry_version")]
    pub registry_version: u32,
    /// Timeout for tunneled HTTP commands in milliseconds (default 8000).
    #[serde(default = "default_client_timeout_ms")]
    pub client_timeout_ms: u64,
    /// How long to wait for the `RchRegistry` ack before proceeding in
    /// degraded mode (default 10000).
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

/// Source discovery polling bounds.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    /// Timeout for the session-start request in milliseconds (default 15000).
    #[serde(default = "default_start_timeout_ms")]
    pub start_timeout_ms: u64,
    /// Delay between deferred-mode polls in milliseconds (default 1000).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Per-poll request timeout in milliseconds (default 3000).
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Maximum polls per discovery session (default 15).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

/// Outbound request dispatch settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Default per-request timeout in milliseconds (default 15000).
    #[serde(default = "default_dispatch_timeout_ms")]
    pub timeout_ms: u64,
    /// Dispatches allowed before the storm guard suppresses (default 10).
    #[serde(default = "default_storm_limit")]
    pub storm_limit: u32,
    /// Quiet period that resets the storm counter in milliseconds (default 4000).
    #[serde(default = "default_storm_window_ms")]
    pub storm_window_ms: u64,
}

/// Runtime platform, resolved once at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformConfig {
    /// One of `generic`, `mobile`, `tv` (default `generic`).
    #[serde(default = "default_platform_kind")]
    pub kind: String,
}

impl PlatformConfig {
    /// Parse the configured kind. Unknown values fall back to `Generic`.
    pub fn resolve(&self) -> Platform {
        match self.kind.as_str() {
            "mobile" => Platform::Mobile,
            "tv" => Platform::Tv,
            _ => Platform::Generic,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_unic_id() -> String {
    "guest".to_string()
}
fn default_player() -> String {
    "inner".to_string()
}
fn default_registry_version() -> u32 {
    149
}
fn default_client_timeout_ms() -> u64 {
    8000
}
fn default_handshake_timeout_ms() -> u64 {
    10000
}
fn default_start_timeout_ms() -> u64 {
    15000
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_poll_timeout_ms() -> u64 {
    3000
}
fn default_max_attempts() -> u32 {
    15
}
fn default_dispatch_timeout_ms() -> u64 {
    15000
}
fn default_storm_limit() -> u32 {
    10
}
fn default_storm_window_ms() -> u64 {
    4000
}
fn default_platform_kind() -> String {
    "generic".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            unic_id: default_unic_id(),
            device_id: String::new(),
            token: String::new(),
            profile_id: String::new(),
            player: default_player(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            registry_version: default_registry_version(),
            client_timeout_ms: default_client_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            start_timeout_ms: default_start_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_timeout_ms: default_poll_timeout_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_dispatch_timeout_ms(),
            storm_limit: default_storm_limit(),
            storm_window_ms: default_storm_window_ms(),
        }
    }
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            kind: default_platform_kind(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            auth: AuthConfig::default(),
            bridge: BridgeConfig::default(),
            discovery: DiscoveryConfig::default(),
            dispatch: DispatchConfig::default(),
            platform: PlatformConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file. Otherwise looks for
    /// `srcbridge.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Result<Self, String> {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .map_err(|e| format!("Failed to read config file {p}: {e}"))?;
            toml::from_str(&content).map_err(|e| format!("Failed to parse config file {p}: {e}"))?
        } else if Path::new("srcbridge.toml").exists() {
            let content = std::fs::read_to_string("srcbridge.toml")
                .map_err(|e| format!("Failed to read srcbridge.toml: {e}"))?;
            toml::from_str(&content).map_err(|e| format!("Failed to parse srcbridge.toml: {e}"))?
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(server) = std::env::var("SRCBRIDGE_SERVER") {
            config.backend.servers = vec![server];
            config.backend.active = 0;
        }
        if let Ok(token) = std::env::var("SRCBRIDGE_TOKEN") {
            config.auth.token = token;
        }
        if let Ok(device_id) = std::env::var("SRCBRIDGE_DEVICE_ID") {
            config.auth.device_id = device_id;
        }

        if config.auth.device_id.is_empty() {
            config.auth.device_id = uuid::Uuid::new_v4().to_string();
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(servers: &[&str], active: usize) -> BackendConfig {
        BackendConfig {
            servers: servers.iter().map(|s| (*s).to_string()).collect(),
            active,
        }
    }

    #[test]
    fn server_url_adds_scheme_and_strips_slashes() {
        let b = backend(&["lamp.example.com:9118///"], 0);
        assert_eq!(
            b.server_url().as_deref(),
            Some("http://lamp.example.com:9118")
        );
    }

    #[test]
    fn server_url_keeps_https() {
        let b = backend(&["https://lamp.example.com"], 0);
        assert_eq!(b.server_url().as_deref(), Some("https://lamp.example.com"));
    }

    #[test]
    fn active_out_of_range_falls_back_to_first() {
        let b = backend(&["a.example.com", "b.example.com"], 7);
        assert_eq!(b.server_url().as_deref(), Some("http://a.example.com"));
    }

    #[test]
    fn host_key_strips_scheme() {
        let b = backend(&["https://lamp.example.com:9118"], 0);
        assert_eq!(b.host_key().as_deref(), Some("lamp.example.com:9118"));
    }

    #[test]
    fn empty_list_is_unconfigured() {
        let b = backend(&[], 0);
        assert!(!b.is_configured());
        assert_eq!(b.host_key(), None);
    }
}
