//! Correlation ID propagation for outbound HTTP calls.
//!
//! A webhook's delivery ID becomes the correlation ID for every request made
//! while processing the resulting job, so upstream logs can be joined with
//! ours.

use std::time::Instant;

use anyhow::{Context, Result};
use http::Extensions;
use reqwest::header::HeaderValue;
use reqwest::{Client, Request, Response};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, Middleware, Next};
use tracing::{debug, warn};
use uuid::Uuid;

/// Header name for correlation ID propagation
pub const CORRELATION_ID_HEADER: &str = "X-Correlation-ID";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    pub fn new_random() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Adds `X-Correlation-ID` to outgoing requests and traces each call.
///
/// An explicit header set by the caller wins over a `CorrelationId` in the
/// request extensions; with neither, a fresh ID is generated.
pub struct CorrelationMiddleware;

#[async_trait::async_trait]
impl Middleware for CorrelationMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        let correlation_id = req
            .headers()
            .get(CORRELATION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| extensions.get::<CorrelationId>().map(|id| id.0.clone()))
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if !req.headers().contains_key(CORRELATION_ID_HEADER) {
            match HeaderValue::from_str(&correlation_id) {
                Ok(value) => {
                    req.headers_mut().insert(CORRELATION_ID_HEADER, value);
                }
                Err(_) => warn!(
                    correlation_id = %correlation_id,
                    "Correlation ID is not a valid header value, sending without it"
                ),
            }
        }

        let method = req.method().clone();
        let url = req.url().clone();
        let started = Instant::now();

        let result = next.run(req, extensions).await;

        match &result {
            Ok(response) => debug!(
                correlation_id = %correlation_id,
                %method,
                url = %url,
                status = response.status().as_u16(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Outbound request completed"
            ),
            Err(e) => warn!(
                correlation_id = %correlation_id,
                %method,
                url = %url,
                error = %e,
                "Outbound request failed"
            ),
        }

        result
    }
}

/// Build the shared HTTP client used by the upstream API and analysis clients.
pub fn create_http_client(user_agent: &str) -> Result<ClientWithMiddleware> {
    let client = Client::builder()
        .user_agent(user_agent)
        .build()
        .context("Failed to create HTTP client")?;

    Ok(ClientBuilder::new(client)
        .with(CorrelationMiddleware)
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_correlation_ids_differ() {
        assert_ne!(CorrelationId::new_random(), CorrelationId::new_random());
    }

    #[test]
    fn test_create_http_client_succeeds() {
        assert!(create_http_client("reviewq-test/0.1").is_ok());
    }
}
