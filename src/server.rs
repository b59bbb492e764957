//! HTTP status surface
//!
//! `GET /health`, `GET /status` and `POST /sync` (force full sync).

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::sync::{SyncService, SyncStatus};
use crate::types::SyncResult;

/// Status server
pub struct StatusServer {
    service: Arc<SyncService>,
    addr: SocketAddr,
}

impl StatusServer {
    pub fn new(service: Arc<SyncService>, port: u16) -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        Self { service, addr }
    }

    /// Build the router
    pub fn router(service: Arc<SyncService>) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/status", get(status_handler))
            .route("/sync", post(sync_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(service)
    }

    /// Serve until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) -> std::io::Result<()> {
        let app = Self::router(self.service);
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!(addr = %self.addr, "status_server_listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        tracing::info!("status_server_stopped");
        Ok(())
    }
}

/// 200 while every table is healthy, 503 otherwise
async fn health_handler(State(service): State<Arc<SyncService>>) -> impl IntoResponse {
    let status = service.status();
    let code = if status.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(serde_json::json!({
            "status": if status.healthy { "ok" } else { "degraded" },
            "running": status.running,
            "consecutive_failures": status.health.consecutive_failures,
            "last_success_at": status.health.last_success_at,
            "last_error": status.health.last_error,
        })),
    )
}

async fn status_handler(State(service): State<Arc<SyncService>>) -> Json<SyncStatus> {
    Json(service.status())
}

async fn sync_handler(State(service): State<Arc<SyncService>>) -> (StatusCode, Json<SyncResult>) {
    let result = service.force_full_sync().await;
    let code = if result.success {
        StatusCode::OK
    } else {
        StatusCode::BAD_GATEWAY
    };
    (code, Json(result))
}
