#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # demogate
//!
//! Session coordinator for a single shared demo terminal.
//!
//! At most one visitor at a time holds a freshly spawned ttyd session;
//! everyone else waits in a strict-FIFO queue and is promoted when the slot
//! frees. Access is gated by single-use invite tokens in redis, and the
//! coordinator mints the opaque session tokens the reverse proxy checks
//! before letting a browser reach the dashboard, the log UI, or the terminal
//! itself.
//!
//! ## API surface
//!
//! | Method | Path                | Description                                |
//! |--------|---------------------|--------------------------------------------|
//! | GET    | `/health`           | Liveness probe                             |
//! | GET    | `/status`           | Queue depth, slot occupancy, wait estimate |
//! | GET    | `/metrics`          | Prometheus text exposition                 |
//! | GET    | `/session/validate` | Auth sub-request (cookie `demo_session`)   |
//! | GET    | `/invite/validate`  | Invite sub-request (header or `?token=`)   |
//! | GET    | `/ws`               | Client protocol (framed JSON)              |
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap CLI, router setup, graceful shutdown
//! config.rs        — TOML + env-var configuration
//! metrics.rs       — prometheus gauges/counters/histograms
//! token.rs         — HMAC-signed session token minting
//! invites/         — invite validation, audit trail, redis adapter
//! coordinator/     — queue/session state machine (queue, slot, token maps)
//! spawn/           — ttyd subprocess supervision, credential file
//! routes/          — health/status/metrics + proxy sub-requests
//! ws/              — WebSocket surface, framed JSON protocol
//! ```

mod config;
mod coordinator;
mod invites;
mod metrics;
mod routes;
mod spawn;
mod token;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Router};
use clap::Parser;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use config::Config;
use coordinator::Coordinator;
use invites::store::KvStore;
use metrics::GateMetrics;
use spawn::{Spawner, TtydSpawner};

/// Session coordinator for a single shared demo terminal.
#[derive(Parser)]
#[command(name = "demogate", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long)]
    config: Option<String>,
}

/// Shared application state passed to every handler via Axum's `State`
/// extractor.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// The queue/session state machine.
    pub coordinator: Coordinator,
    /// Key-value store adapter (invites, best-effort session records).
    pub store: KvStore,
    /// Prometheus registry handle.
    pub metrics: GateMetrics,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref());

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("demogate v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on port {}", config.server.port);
    info!(
        "Session timeout {}min, queue bound {}",
        config.session.timeout_minutes, config.session.max_queue_size
    );

    if config.session.secret == "change-me" {
        warn!("Using default session secret — set SESSION_SECRET or update config");
    }

    let config = Arc::new(config);
    let store = KvStore::connect(&config.redis.url);
    let metrics = GateMetrics::new();
    let spawner: Arc<dyn Spawner> = Arc::new(TtydSpawner::new(Arc::clone(&config)));
    let coordinator = Coordinator::new(
        Arc::clone(&config),
        store.clone(),
        spawner,
        metrics.clone(),
    );

    let state = AppState {
        config: Arc::clone(&config),
        coordinator: coordinator.clone(),
        store,
        metrics,
    };

    let app = Router::new()
        .route("/health", get(routes::health::health))
        .route("/status", get(routes::health::status))
        .route("/metrics", get(routes::health::metrics))
        .route("/session/validate", get(routes::validate::session_validate))
        .route("/invite/validate", get(routes::validate::invite_validate))
        .route("/ws", get(ws::ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = TcpListener::bind(("0.0.0.0", config.server.port))
        .await
        .expect("Failed to bind");

    info!("Server ready");

    // Graceful shutdown on SIGINT/SIGTERM
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .expect("Server error");

    // Cleanup: the active session (if any) ends with reason `shutdown`.
    info!("Shutting down...");
    coordinator.shutdown().await;
    info!("Goodbye");
}
