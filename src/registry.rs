//! Per-host connection and negotiation state.
//!
//! [`HostRegistry`] maps a backend host key to its [`HostEntry`]. Entries are
//! created lazily on first access and live for the process lifetime — stale
//! entries for abandoned hosts are acceptable garbage. All per-host state
//! that must survive reconnects (negotiated transport type, registration
//! flag, reported app build) lives here rather than on the connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

/// Negotiated strategy for routing requests to a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// Running inside the mobile app shell — requests go through it natively.
    Apk,
    /// Backend is CORS-reachable from the viewer.
    Cors,
    /// Backend is not directly reachable; requests tunnel through the bridge.
    Web,
}

impl TransportType {
    /// Wire name used in handshake payloads and `rchtype` query parameters.
    pub fn as_str(self) -> &'static str {
        match self {
            TransportType::Apk => "apk",
            TransportType::Cors => "cors",
            TransportType::Web => "web",
        }
    }
}

/// State for one backend host. Mutated only by the transport probe and the
/// bridge client; reads are lock-free where the field allows it.
pub struct HostEntry {
    /// Probe result. `get_or_init` collapses concurrent probes onto one
    /// in-flight resolution; once set it is never re-probed.
    pub transport: OnceCell<TransportType>,
    /// Whether the registry handshake has completed for this host.
    pub registered: AtomicBool,
    /// App build number reported during the handshake (0 outside the app shell).
    pub apk_version: AtomicU32,
    /// Tunnel connection id reported by the backend. Diagnostic only.
    connection_id: Mutex<Option<String>>,
}

impl HostEntry {
    fn new() -> Self {
        Self {
            transport: OnceCell::new(),
            registered: AtomicBool::new(false),
            apk_version: AtomicU32::new(0),
            connection_id: Mutex::new(None),
        }
    }

    /// The cached transport type, if the probe has completed.
    pub fn transport_type(&self) -> Option<TransportType> {
        self.transport.get().copied()
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    pub fn mark_registered(&self) {
        self.registered.store(true, Ordering::SeqCst);
    }

    /// Record the backend-assigned tunnel connection id.
    pub fn set_connection_id(&self, id: String) {
        *self.connection_id.lock().expect("connection_id lock") = Some(id);
    }

    pub fn connection_id(&self) -> Option<String> {
        self.connection_id.lock().expect("connection_id lock").clone()
    }
}

/// Process-wide table of per-host state, injected by reference into the
/// components that need it. Entries are never removed.
#[derive(Default)]
pub struct HostRegistry {
    hosts: Mutex<HashMap<String, Arc<HostEntry>>>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the entry for a host key, creating it on first access.
    pub fn entry(&self, host_key: &str) -> Arc<HostEntry> {
        let mut hosts = self.hosts.lock().expect("host registry lock");
        Arc::clone(
            hosts
                .entry(host_key.to_string())
                .or_insert_with(|| Arc::new(HostEntry::new())),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_is_created_once_per_key() {
        let registry = HostRegistry::new();
        let a = registry.entry("lamp.example.com");
        let b = registry.entry("lamp.example.com");
        assert!(Arc::ptr_eq(&a, &b));
        let other = registry.entry("other.example.com");
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[test]
    fn registration_flag_round_trips() {
        let registry = HostRegistry::new();
        let entry = registry.entry("lamp.example.com");
        assert!(!entry.is_registered());
        entry.mark_registered();
        assert!(registry.entry("lamp.example.com").is_registered());
    }

    #[test]
    fn connection_id_is_recorded() {
        let entry = HostEntry::new();
        assert_eq!(entry.connection_id(), None);
        entry.set_connection_id("conn-1".into());
        assert_eq!(entry.connection_id().as_deref(), Some("conn-1"));
    }
}
