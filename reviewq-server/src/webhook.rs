//! Webhook endpoint.
//!
//! `POST /webhook/{provider}` hands the raw body and headers to the
//! `Ingestor` and maps its outcome onto HTTP:
//!
//! - 200: accepted (recorded and enqueued) or ignored
//! - 400: missing event header or malformed in-scope payload
//! - 401: signature verification failed
//! - 404: unknown provider
//! - 500/503: store or queue failure before the enqueue was confirmed, so
//!   the sender retries the delivery

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use axum::Router;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

use crate::ingest::{InboundEvent, IngestError, IngestOutcome};
use crate::store::StoreError;
use crate::AppState;

const HEADER_EVENT: &str = "x-github-event";
const HEADER_DELIVERY: &str = "x-github-delivery";
const HEADER_SIGNATURE: &str = "x-hub-signature-256";

/// GitHub caps webhook payloads at 25 MB.
const MAX_BODY_BYTES: usize = 25 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("unknown webhook provider: {0}")]
    UnknownProvider(String),

    #[error(transparent)]
    Ingest(#[from] IngestError),
}

impl WebhookError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::UnknownProvider(_) => StatusCode::NOT_FOUND,
            Self::Ingest(IngestError::Unauthorized) => StatusCode::UNAUTHORIZED,
            Self::Ingest(IngestError::MissingEventKind | IngestError::Malformed(_)) => {
                StatusCode::BAD_REQUEST
            }
            Self::Ingest(IngestError::Store(StoreError::Unavailable)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Ingest(IngestError::Store(_) | IngestError::Queue(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Webhook ingestion failed: {}", self);
        }
        let body = WebhookResponse {
            message: self.to_string(),
            job_key: None,
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_key: Option<String>,
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

pub async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, WebhookError> {
    if provider != "github" {
        warn!("Webhook for unknown provider '{}'", provider);
        return Err(WebhookError::UnknownProvider(provider));
    }

    let outcome = state
        .ingestor
        .ingest(InboundEvent {
            event_kind: header(&headers, HEADER_EVENT),
            delivery_id: header(&headers, HEADER_DELIVERY),
            signature: header(&headers, HEADER_SIGNATURE),
            body: &body,
        })
        .await?;

    let response = match outcome {
        IngestOutcome::Ignored => WebhookResponse {
            message: "Event ignored".to_string(),
            job_key: None,
        },
        IngestOutcome::Accepted {
            job_key, enqueue, ..
        } => WebhookResponse {
            message: format!("Review scheduled ({:?})", enqueue),
            job_key: Some(job_key.to_string()),
        },
    };
    Ok(Json(response))
}

pub fn webhook_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/webhook/{provider}", post(webhook_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
}
