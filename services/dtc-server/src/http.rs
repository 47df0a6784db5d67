//! Read-only HTTP status endpoint
//!
//! `GET /health`, `/status`, `/metrics` and `/sessions`, all JSON.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::server::{DtcServer, ServerStatus};
use crate::session::SessionInfo;

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub running: bool,
}

pub fn create_router(server: Arc<DtcServer>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .route("/sessions", get(sessions))
        .layer(TraceLayer::new_for_http())
        .with_state(server)
}

async fn health(State(server): State<Arc<DtcServer>>) -> Json<Health> {
    Json(Health {
        status: "ok",
        running: server.is_running(),
    })
}

async fn status(State(server): State<Arc<DtcServer>>) -> Json<ServerStatus> {
    Json(server.status())
}

async fn metrics(State(server): State<Arc<DtcServer>>) -> Json<BTreeMap<String, u64>> {
    Json(server.metrics())
}

async fn sessions(State(server): State<Arc<DtcServer>>) -> Json<Vec<SessionInfo>> {
    Json(server.sessions())
}

/// Serve the status endpoint on `listener` until `cancel` fires.
pub async fn serve(
    server: Arc<DtcServer>,
    listener: TcpListener,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let addr: Option<SocketAddr> = listener.local_addr().ok();
    info!(addr = ?addr, "Status endpoint listening");
    axum::serve(listener, create_router(server))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}
