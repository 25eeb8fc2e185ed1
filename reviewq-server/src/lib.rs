pub mod classify;
pub mod collaborators;
pub mod config;
pub mod db;
pub mod github;
pub mod health;
pub mod ids;
pub mod ingest;
pub mod maintenance;
pub mod payload;
pub mod queue;
pub mod signature;
pub mod state_machine;
pub mod status;
pub mod store;
pub mod webhook;
pub mod worker;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

pub use github::GitHubClient;
pub use reviewq_core::get_bot_version;

use crate::ingest::Ingestor;
use crate::queue::JobQueue;
use crate::store::RecordStore;

/// Process-wide handles shared by every request.
pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    pub queue: Arc<dyn JobQueue>,
    pub ingestor: Ingestor,
    pub version: String,
}

impl AppState {
    pub fn new(
        store: Arc<dyn RecordStore>,
        queue: Arc<dyn JobQueue>,
        webhook_secret: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            ingestor: Ingestor::new(store.clone(), queue.clone(), webhook_secret),
            store,
            queue,
            version: get_bot_version(),
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health/live", get(health::live_handler))
        .route("/health/ready", get(health::ready_handler))
        .route("/status", get(status::status_handler))
        .merge(webhook::webhook_router())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}
