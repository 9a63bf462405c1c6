//! Liveness endpoint: `GET /health` reports process-local counts.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::registry::SessionRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub open_documents: usize,
    pub connections: usize,
}

impl HealthReport {
    pub async fn collect(registry: &SessionRegistry) -> Self {
        Self {
            status: "ok".to_string(),
            open_documents: registry.session_count().await,
            connections: registry.connection_count().await,
        }
    }
}

async fn health(State(registry): State<Arc<SessionRegistry>>) -> Json<HealthReport> {
    Json(HealthReport::collect(&registry).await)
}

pub fn router(registry: Arc<SessionRegistry>) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(registry)
}

/// Serve the health router on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    log::info!("health endpoint listening on {}", listener.local_addr()?);
    axum::serve(listener, router(registry))
        .with_graceful_shutdown(shutdown)
        .await
}
