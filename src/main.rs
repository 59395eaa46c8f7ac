//! Beacon - provider status aggregation and error correlation service
//!
//! Probe agents push health-check readings, a periodic cycle folds them into
//! one status per provider, and user-reported errors are classified against
//! that status.

mod config;
mod correlation;
mod db;
mod ingest;
mod probe;
mod scheduler;
mod web;

use config::ServerConfig;
use db::Store;
use scheduler::Scheduler;
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("beacon=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting Beacon on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);
    tracing::info!(
        "Aggregating every {:?} over a {:?} window ({} merge)",
        cfg.aggregation_interval,
        cfg.aggregation.window,
        cfg.aggregation.merge
    );
    if cfg.api_key.is_none() {
        tracing::warn!("BEACON_API_KEY is not set; ingestion and administration will reject every request");
    }

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    if store.list_endpoints()?.is_empty() {
        tracing::info!("No endpoints registered yet; add some via POST /api/endpoints");
    }

    // Start scheduler
    let scheduler = Arc::new(Scheduler::new(store.clone(), &cfg));
    scheduler.start().await?;

    // Start web server
    let server = Server::new(cfg, store, scheduler.clone());
    server
        .start(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown signal received");
        })
        .await?;

    scheduler.stop();

    Ok(())
}
