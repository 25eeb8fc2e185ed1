//! `GET /status`: queue depth and job counts as JSON.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use tracing::error;

use crate::queue::QueueStats;
use crate::store::JobCounts;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct StatusData {
    pub version: String,
    pub queue: QueueStats,
    pub jobs: JobCounts,
}

pub async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    let queue = match state.queue.stats().await {
        Ok(stats) => stats,
        Err(e) => {
            error!("Failed to read queue stats: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "queue unavailable").into_response();
        }
    };
    let jobs = match state.store.job_counts().await {
        Ok(counts) => counts,
        Err(e) => {
            error!("Failed to read job counts: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "record store unavailable")
                .into_response();
        }
    };

    Json(StatusData {
        version: state.version.clone(),
        queue,
        jobs,
    })
    .into_response()
}
