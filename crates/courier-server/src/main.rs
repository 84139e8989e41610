//! # courier-server
//!
//! Realtime one-to-one messaging server.
//!
//! This binary provides:
//! - **WebSocket gateway** (axum) translating realtime events into calls
//!   against the delivery engine and status propagator
//! - **Durable message log** (SQLite via courier-store) with monotonic
//!   sent/delivered/seen receipt tracking
//! - **In-memory presence registry** mapping open connections to online
//!   users, broadcast to all clients on change
//! - **REST API** for health checks, conversation history and chat lists

mod api;
mod config;
mod delivery;
mod error;
mod gateway;
mod presence;
mod status;

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

use courier_store::Database;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::delivery::DeliveryEngine;
use crate::gateway::ConnectionHub;
use crate::presence::PresenceRegistry;
use crate::status::StatusPropagator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,courier_server=debug")),
        )
        .init();

    info!("Starting Courier server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------

    // Durable message store (migrations run on open).
    let database = match &config.db_path {
        Some(path) => Database::open_at(path)?,
        None => Database::new()?,
    };
    let store = Arc::new(Mutex::new(database));

    // Presence registry: process lifetime, torn down with the process.
    let presence = PresenceRegistry::new();

    // Connection hub for notification fan-out.
    let hub = ConnectionHub::new();

    let delivery = DeliveryEngine::new(store.clone(), presence.clone());
    let propagator = StatusPropagator::new(store.clone());

    let state = AppState {
        store,
        presence,
        hub,
        delivery,
        propagator,
        config: Arc::new(config.clone()),
    };

    // -----------------------------------------------------------------------
    // 4. Run the HTTP/WebSocket server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(state, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
