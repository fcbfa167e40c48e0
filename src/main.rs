#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # srcbridge
//!
//! Command-line front end for the media source resolution engine.
//!
//! ## Subcommands
//!
//! - `srcbridge resolve` — run a discovery session for a title and print the
//!   offered sources plus the one selected for playback
//! - `srcbridge probe` — negotiate and print the transport type for the
//!   configured backend
//!
//! ## Architecture
//!
//! ```text
//! main.rs        — entry point, clap subcommands, tracing init
//! config.rs      — TOML + env-var configuration
//! engine.rs      — fetch_with_tunnel, discover_sources, search_capable
//! dispatch.rs    — canonicalization, storm guard, sentinel detection
//! query.rs       — session-start URL construction
//! discovery.rs   — deferred polling loop, snapshot observer, selection
//! failover.rs    — balancer failover countdown
//! probe.rs       — transport-type negotiation (apk / cors / web)
//! registry.rs    — per-host state (transport, registration, connection id)
//! bridge/
//!   mod.rs       — WebSocket bridge, RchRegistry handshake, io loop
//!   executor.rs  — tunneled command execution (ping, eval, HTTP relay)
//! storage.rs     — viewer-side persistence (choices, last sources)
//! ```

use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use srcbridge::discovery::SnapshotObserver;
use srcbridge::probe::TransportProbe;
use srcbridge::registry::HostRegistry;
use srcbridge::{Config, Engine, MediaQuery, MemoryStorage};

/// Media source resolution engine with a viewer-side command bridge.
#[derive(Parser)]
#[command(name = "srcbridge", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a discovery session for a title and print the resolved sources.
    Resolve {
        /// Catalog id of the title.
        #[arg(long)]
        id: u64,
        /// Title to resolve.
        #[arg(long)]
        title: String,
        /// Original (untranslated) title.
        #[arg(long)]
        original_title: Option<String>,
        /// IMDb id, e.g. tt0137523.
        #[arg(long)]
        imdb_id: Option<String>,
        /// Kinopoisk id.
        #[arg(long)]
        kinopoisk_id: Option<u64>,
        /// Release date, e.g. 1999-10-15.
        #[arg(long)]
        release_date: Option<String>,
        /// Treat the title as a series.
        #[arg(long)]
        serial: bool,
        /// Force a specific source key instead of the remembered one.
        #[arg(long)]
        source: Option<String>,
    },
    /// Negotiate and print the transport type for the configured backend.
    Probe,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("srcbridge: {e}");
            std::process::exit(2);
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let exit = match cli.command {
        Commands::Resolve {
            id,
            title,
            original_title,
            imdb_id,
            kinopoisk_id,
            release_date,
            serial,
            source,
        } => {
            let query = MediaQuery {
                id,
                title,
                original_title,
                imdb_id,
                kinopoisk_id,
                release_date,
                serial,
                ..MediaQuery::default()
            };
            run_resolve(config, &query, source.as_deref()).await
        }
        Commands::Probe => run_probe(config).await,
    };
    std::process::exit(exit);
}

async fn run_resolve(config: Config, query: &MediaQuery, source: Option<&str>) -> i32 {
    let engine = Engine::new(config, Arc::new(MemoryStorage::new()));

    // Abandon the session on Ctrl-C so nothing resolves behind the viewer.
    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_cancel.cancel();
        }
    });

    let observer: SnapshotObserver = Arc::new(|set| {
        info!(
            sources = set.len(),
            visible = set.values().filter(|s| s.show).count(),
            "Snapshot"
        );
    });

    match engine
        .discover_sources(query, source, &cancel, Some(observer))
        .await
    {
        Ok(outcome) => match outcome.completed() {
            Some(resolved) => {
                let sources: Vec<_> = resolved
                    .sources
                    .iter()
                    .map(|(key, s)| json!({"key": key, "name": s.name, "url": s.url}))
                    .collect();
                let report = json!({"active": resolved.active, "sources": sources});
                println!("{report:#}");
                0
            }
            None => {
                info!("Discovery suppressed or cancelled");
                1
            }
        },
        Err(e) => {
            error!("Resolution failed: {e}");
            1
        }
    }
}

async fn run_probe(config: Config) -> i32 {
    let (Some(server_url), Some(host_key)) =
        (config.backend.server_url(), config.backend.host_key())
    else {
        error!("No backend server configured");
        return 2;
    };

    let registry = Arc::new(HostRegistry::new());
    let own_host = std::env::var("HOSTNAME").unwrap_or_default();
    let probe = TransportProbe::new(registry, config.platform.resolve(), own_host);
    let transport = probe.resolve_type(&host_key, &server_url).await;
    println!("{}", transport.as_str());
    0
}
