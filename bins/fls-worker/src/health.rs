// Health and metrics endpoints for the worker

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::State,
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use fls_common::Arch;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::metrics;

#[derive(Clone)]
pub struct HealthState {
    pub arch: Arch,
    pub start_time: Arc<Instant>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub arch: Arch,
    pub uptime_secs: u64,
}

pub fn routes(arch: Arch) -> Router {
    let state = HealthState {
        arch,
        start_time: Arc::new(Instant::now()),
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn health_check(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        arch: state.arch,
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render_metrics(),
    )
}

/// Serve until `shutdown` fires.
pub async fn serve(listener: TcpListener, arch: Arch, shutdown: CancellationToken) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("health server listening on {}", addr);
    }
    axum::serve(listener, routes(arch))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
