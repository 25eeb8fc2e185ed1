//! Liveness and readiness probes.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use tracing::warn;

use crate::AppState;

/// `GET /health/live`: the process is up and serving requests.
pub async fn live_handler() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

/// `GET /health/ready`: the record store and the queue both answer a ping.
pub async fn ready_handler(State(state): State<Arc<AppState>>) -> (StatusCode, &'static str) {
    if let Err(e) = state.store.ping().await {
        warn!("Readiness check failed: record store: {}", e);
        return (StatusCode::SERVICE_UNAVAILABLE, "record store unavailable");
    }
    if let Err(e) = state.queue.ping().await {
        warn!("Readiness check failed: queue: {}", e);
        return (StatusCode::SERVICE_UNAVAILABLE, "queue unavailable");
    }
    (StatusCode::OK, "OK")
}
