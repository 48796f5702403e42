//! Web server module exposing run reports.

mod handlers;

use crate::scheduler::Scheduler;

use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
}

/// Web server for pingwatch.
pub struct Server {
    port: u16,
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(port: u16, scheduler: Arc<Scheduler>) -> Self {
        Self {
            port,
            state: AppState { scheduler },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            .route("/healthz", get(handlers::handle_health))
            .route("/api/runs", post(handlers::handle_trigger_run))
            .route("/api/runs/latest", get(handlers::handle_latest_run))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve on the configured port until shutdown.
    pub async fn start(
        &self,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await?;

        Ok(())
    }
}
