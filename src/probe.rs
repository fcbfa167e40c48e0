//! Transport-type negotiation.
//!
//! Determines, once per host key, how requests should be routed: `apk`
//! (mobile app shell), `cors` (direct browser-style requests are allowed),
//! or `web` (backend unreachable directly — tunnel required). The result is
//! cached on the host entry for the process lifetime and never re-probed,
//! even if network conditions change.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::platform::Platform;
use crate::registry::{HostRegistry, TransportType};

/// Path on the backend that answers CORS-capability probes.
const CORS_CHECK_PATH: &str = "/cors/check";
/// Well-known public origin probed instead of the backend when the backend
/// origin would be a self-check.
const REACHABILITY_CHECK_URL: &str = "https://github.com/";

/// Resolves and caches the transport type per host key.
pub struct TransportProbe {
    registry: Arc<HostRegistry>,
    platform: Platform,
    http: reqwest::Client,
    /// The viewer's own host, used to avoid probing ourselves.
    own_host: String,
}

impl TransportProbe {
    pub fn new(registry: Arc<HostRegistry>, platform: Platform, own_host: String) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to build HTTP client");
        Self {
            registry,
            platform,
            http,
            own_host,
        }
    }

    /// Resolve the transport type for a host. Idempotent per host key —
    /// concurrent callers before resolution await the same in-flight probe,
    /// and later callers get the cached result.
    pub async fn resolve_type(&self, host_key: &str, origin: &str) -> TransportType {
        let entry = self.registry.entry(host_key);
        *entry
            .transport
            .get_or_init(|| self.probe(host_key, origin))
            .await
    }

    async fn probe(&self, host_key: &str, origin: &str) -> TransportType {
        let resolved = match self.platform {
            Platform::Mobile => TransportType::Apk,
            Platform::Tv => TransportType::Cors,
            Platform::Generic => {
                let check_url = if !self.own_host.is_empty() && origin.contains(&self.own_host) {
                    REACHABILITY_CHECK_URL.to_string()
                } else {
                    format!("{origin}{CORS_CHECK_PATH}")
                };
                match self.http.get(&check_url).send().await {
                    Ok(resp) if resp.status().is_success() => TransportType::Cors,
                    Ok(resp) => {
                        warn!(host = host_key, status = %resp.status(), "CORS probe rejected");
                        TransportType::Web
                    }
                    Err(e) => {
                        warn!(host = host_key, "CORS probe failed: {e}");
                        TransportType::Web
                    }
                }
            }
        };
        debug!(host = host_key, transport = resolved.as_str(), "Transport type resolved");
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn mobile_platform_is_apk_without_probing() {
        let registry = Arc::new(HostRegistry::new());
        let probe = TransportProbe::new(Arc::clone(&registry), Platform::Mobile, String::new());
        let t = probe
            .resolve_type("lamp.example.com", "http://lamp.example.com")
            .await;
        assert_eq!(t, TransportType::Apk);
        assert_eq!(
            registry.entry("lamp.example.com").transport_type(),
            Some(TransportType::Apk)
        );
    }

    #[tokio::test]
    async fn tv_platform_is_cors_without_probing() {
        let registry = Arc::new(HostRegistry::new());
        let probe = TransportProbe::new(registry, Platform::Tv, String::new());
        let t = probe
            .resolve_type("lamp.example.com", "http://lamp.example.com")
            .await;
        assert_eq!(t, TransportType::Cors);
    }

    #[tokio::test]
    async fn concurrent_resolution_collapses_to_one_probe() {
        // OnceCell::get_or_init guarantees a single init; exercise it with a
        // counting future via the entry directly.
        let registry = Arc::new(HostRegistry::new());
        let entry = registry.entry("lamp.example.com");
        let probes = Arc::new(AtomicU32::new(0));

        let (a, b) = tokio::join!(
            entry.transport.get_or_init(|| {
                let probes = Arc::clone(&probes);
                async move {
                    probes.fetch_add(1, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    TransportType::Cors
                }
            }),
            entry.transport.get_or_init(|| {
                let probes = Arc::clone(&probes);
                async move {
                    probes.fetch_add(1, Ordering::SeqCst);
                    TransportType::Web
                }
            }),
        );

        assert_eq!(*a, *b);
        assert_eq!(probes.load(Ordering::SeqCst), 1);
    }
}
