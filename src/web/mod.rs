//! Web server module.

mod error;
mod handlers;

pub use error::*;

use crate::config::ServerConfig;
use crate::db::Store;
use crate::scheduler::Scheduler;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<Store>,
    pub scheduler: Arc<Scheduler>,
}

/// Web server for the Beacon Network.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(config: ServerConfig, store: Arc<Store>, scheduler: Arc<Scheduler>) -> Self {
        Self {
            state: AppState {
                config,
                store,
                scheduler,
            },
        }
    }

    /// Build the router with all routes.
    pub fn routes(&self) -> Router {
        router(self.state.clone())
    }

    /// Serve on the configured port until `shutdown` resolves.
    pub async fn start<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

    Router::new()
        // Public status board
        .route("/", get(handlers::handle_dashboard))
        .route("/api/status", get(handlers::handle_list_status))
        .route("/api/status/{provider}", get(handlers::handle_get_status))
        // Probe ingestion
        .route("/api/beacon", post(handlers::handle_ingest))
        // Error correlation
        .route("/api/correlate", post(handlers::handle_correlate))
        // Administration
        .route(
            "/api/endpoints",
            get(handlers::handle_list_endpoints).post(handlers::handle_create_endpoint),
        )
        .route("/api/endpoints/{id}", put(handlers::handle_update_endpoint))
        .route(
            "/api/aggregate",
            get(handlers::handle_last_cycles).post(handlers::handle_trigger_aggregation),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(4 * 1024 * 1024)) // 4MB
        .with_state(state)
}
