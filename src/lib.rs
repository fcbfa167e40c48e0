#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]

//! srcbridge library — media source resolution with a viewer-side command
//! bridge.
//!
//! The backend probes streaming balancers server-side; this crate drives
//! that process from the viewer: it negotiates how requests reach the
//! backend, opens a WebSocket bridge when the backend needs to route
//! requests through the viewer's network position, polls discovery sessions
//! until a playable source appears, and fails over to the next source when
//! playback breaks.
//!
//! Building blocks:
//! - `engine` — top-level operations (`fetch_with_tunnel`, `discover_sources`)
//! - `bridge` — WebSocket bridge, registry handshake, tunneled commands
//! - `discovery` — session-start and the deferred polling loop
//! - `dispatch` — URL canonicalization, storm guard, sentinel detection
//! - `failover` — balancer failover countdown
//! - `probe` / `registry` — transport negotiation and per-host state
//! - `query` — session-start URL construction
//! - `storage` — viewer-side persistence (choices, last sources)
//! - `config` — TOML + env-var configuration

pub mod bridge;
pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod failover;
pub mod platform;
pub mod probe;
pub mod query;
pub mod registry;
pub mod storage;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use engine::{Engine, ResolvedSources};
pub use error::{BridgeError, EngineError};
pub use platform::Platform;
pub use query::MediaQuery;
pub use storage::{MemoryStorage, Storage};
