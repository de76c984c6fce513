//! # Courier Server
//!
//! Realtime message-routing hub.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! courier
//!
//! # Run with a config file in the working directory
//! # (courier.toml, /etc/courier/courier.toml, ~/.config/courier/courier.toml)
//! courier
//!
//! # Run with environment variables
//! COURIER_PORT=8080 COURIER_HOST=0.0.0.0 courier
//! ```

mod auth;
mod config;
mod handlers;
mod metrics;

use std::sync::Arc;

use anyhow::Result;
use courier_core::{Bridge, Coordinator, CoordinatorHandle, MemoryBroker, MemoryStore};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Courier server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Single-instance wiring: in-process broker and store. Multi-instance
    // deployments substitute networked implementations of the same traits.
    let broker = Arc::new(MemoryBroker::new());
    let store = Arc::new(MemoryStore::new());

    // The hub is built once here and shared through server state.
    let (coordinator, events) =
        CoordinatorHandle::channel(config.limits.event_queue_capacity);
    let bridge = Arc::new(Bridge::new(broker, coordinator.clone()));
    bridge.watch_broadcast();
    tokio::spawn(Coordinator::new(bridge, store.clone()).run(events));

    let auth = Arc::new(auth::DevTokenResolver);

    // Start the server
    handlers::run_server(config, coordinator, auth, store).await?;

    Ok(())
}
