//! Webhook ingestion: verify, classify, record, enqueue.
//!
//! Everything here runs inside the request. Each step short-circuits, so an
//! unauthenticated or out-of-scope event never reaches the store or queue.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::classify::classify;
use crate::ids::{JobId, JobKey};
use crate::payload::{peek_action, PayloadError, PullRequestEvent};
use crate::queue::{EnqueueOutcome, JobQueue, QueueError};
use crate::signature;
use crate::store::{RecordStore, StoreError};

/// An inbound webhook request, as the HTTP layer received it.
#[derive(Debug, Clone, Copy)]
pub struct InboundEvent<'a> {
    pub event_kind: Option<&'a str>,
    pub delivery_id: Option<&'a str>,
    pub signature: Option<&'a str>,
    pub body: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Authentic but not something the pipeline acts on.
    Ignored,
    Accepted {
        job_id: JobId,
        job_key: JobKey,
        enqueue: EnqueueOutcome,
    },
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("webhook signature verification failed")]
    Unauthorized,

    #[error("missing X-GitHub-Event header")]
    MissingEventKind,

    #[error(transparent)]
    Malformed(#[from] PayloadError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

pub struct Ingestor {
    store: Arc<dyn RecordStore>,
    queue: Arc<dyn JobQueue>,
    webhook_secret: Vec<u8>,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn RecordStore>,
        queue: Arc<dyn JobQueue>,
        webhook_secret: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            store,
            queue,
            webhook_secret: webhook_secret.into(),
        }
    }

    pub async fn ingest(&self, event: InboundEvent<'_>) -> Result<IngestOutcome, IngestError> {
        let delivery = event.delivery_id.unwrap_or("-");

        if !signature::verify(event.body, event.signature, &self.webhook_secret) {
            warn!(delivery, "Rejecting webhook with invalid signature");
            return Err(IngestError::Unauthorized);
        }

        let event_kind = event.event_kind.ok_or(IngestError::MissingEventKind)?;

        // Only pull_request bodies are ever parsed.
        if event_kind != "pull_request" {
            debug!(delivery, event_kind, "Ignoring event");
            return Ok(IngestOutcome::Ignored);
        }

        let action = peek_action(event.body)?;
        if !classify(event_kind, action.as_deref()).in_scope {
            debug!(delivery, action = ?action, "Ignoring pull_request action");
            return Ok(IngestOutcome::Ignored);
        }

        let pr = PullRequestEvent::parse(event.body)?;
        let job_key = pr.job_key();

        let repository_id = self.store.upsert_repository(&pr.repository_upsert()).await?;
        let change_request_id = self
            .store
            .upsert_change_request(repository_id, &pr.change_request_upsert())
            .await?;
        let job_id = self
            .store
            .upsert_job_pending(change_request_id, &job_key)
            .await?;

        let payload = pr.review_payload(event.delivery_id.map(str::to_string));
        let payload = serde_json::to_value(&payload)
            .map_err(|e| QueueError::storage("encode payload", e.to_string()))?;
        let enqueue = self.queue.enqueue(&job_key, &payload).await?;

        info!(
            delivery,
            job_key = %job_key,
            "Accepted {} #{} ({}): {:?}",
            pr.repo_full_name(),
            pr.number,
            pr.action,
            enqueue
        );

        Ok(IngestOutcome::Accepted {
            job_id,
            job_key,
            enqueue,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::tests::pull_request_body;
    use crate::payload::ReviewPayload;
    use crate::queue::{QueueConfig, SqliteQueue};
    use crate::signature::{compute_signature, format_signature_header};
    use crate::queue::FailOutcome;
    use crate::state_machine::{JobEvent, JobStatus, JobTracker};
    use crate::store::InMemoryRecordStore;

    const SECRET: &str = "test-secret";

    struct Harness {
        store: Arc<InMemoryRecordStore>,
        queue: Arc<SqliteQueue>,
        ingestor: Ingestor,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryRecordStore::new());
        let queue = Arc::new(SqliteQueue::new_in_memory(QueueConfig::default()).unwrap());
        let ingestor = Ingestor::new(store.clone(), queue.clone(), SECRET);
        Harness {
            store,
            queue,
            ingestor,
        }
    }

    fn sign(body: &[u8]) -> String {
        format_signature_header(&compute_signature(body, SECRET.as_bytes()))
    }

    async fn send(h: &Harness, kind: &str, body: &[u8]) -> Result<IngestOutcome, IngestError> {
        let signature = sign(body);
        h.ingestor
            .ingest(InboundEvent {
                event_kind: Some(kind),
                delivery_id: Some("delivery-1"),
                signature: Some(&signature),
                body,
            })
            .await
    }

    #[tokio::test]
    async fn test_opened_event_creates_pending_job_and_entry() {
        let h = harness();
        let body = pull_request_body("opened", 42, 7).to_string();

        let outcome = send(&h, "pull_request", body.as_bytes()).await.unwrap();
        let (job_key, enqueue) = match outcome {
            IngestOutcome::Accepted {
                job_key, enqueue, ..
            } => (job_key, enqueue),
            other => panic!("expected Accepted, got {:?}", other),
        };
        assert_eq!(job_key.to_string(), "42:7");
        assert_eq!(enqueue, EnqueueOutcome::Enqueued);

        let job = h.store.get_job_by_key(&job_key).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);

        let stats = h.queue.stats().await.unwrap();
        assert_eq!(stats.waiting, 1);

        let lease = h.queue.try_dequeue().await.unwrap().unwrap();
        assert_eq!(lease.job_key.to_string(), "42:7");
        let payload: ReviewPayload = serde_json::from_value(lease.payload).unwrap();
        assert_eq!(payload.number, 7);
        assert_eq!(payload.installation_id, 99);
        assert_eq!(payload.delivery_id.as_deref(), Some("delivery-1"));
    }

    #[tokio::test]
    async fn test_redelivery_yields_one_job_and_one_entry() {
        let h = harness();
        let body = pull_request_body("opened", 42, 7).to_string();

        send(&h, "pull_request", body.as_bytes()).await.unwrap();
        let second = send(&h, "pull_request", body.as_bytes()).await.unwrap();

        assert!(matches!(
            second,
            IngestOutcome::Accepted {
                enqueue: EnqueueOutcome::Merged,
                ..
            }
        ));
        assert_eq!(h.store.job_counts().await.unwrap().pending, 1);
        let stats = h.queue.stats().await.unwrap();
        assert_eq!(stats.waiting + stats.active + stats.delayed, 1);
    }

    #[tokio::test]
    async fn test_closed_event_has_no_side_effects() {
        let h = harness();
        let body = pull_request_body("closed", 42, 7).to_string();

        let outcome = send(&h, "pull_request", body.as_bytes()).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Ignored);
        assert_eq!(h.store.job_counts().await.unwrap().pending, 0);
        assert_eq!(h.queue.stats().await.unwrap().waiting, 0);
    }

    #[tokio::test]
    async fn test_other_event_kinds_are_ignored_without_parsing() {
        let h = harness();
        let outcome = send(&h, "push", b"not even json").await.unwrap();
        assert_eq!(outcome, IngestOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_bad_signature_writes_nothing() {
        let h = harness();
        let body = pull_request_body("opened", 42, 7).to_string();

        let result = h
            .ingestor
            .ingest(InboundEvent {
                event_kind: Some("pull_request"),
                delivery_id: None,
                signature: Some("sha256=00"),
                body: body.as_bytes(),
            })
            .await;
        assert!(matches!(result, Err(IngestError::Unauthorized)));
        assert!(h.store.get_job_by_key(&JobKey::new(42, 7)).await.unwrap().is_none());
        assert_eq!(h.queue.stats().await.unwrap().waiting, 0);
    }

    #[tokio::test]
    async fn test_missing_event_kind() {
        let h = harness();
        let body = b"{}";
        let signature = sign(body);
        let result = h
            .ingestor
            .ingest(InboundEvent {
                event_kind: None,
                delivery_id: None,
                signature: Some(&signature),
                body,
            })
            .await;
        assert!(matches!(result, Err(IngestError::MissingEventKind)));
    }

    #[tokio::test]
    async fn test_malformed_in_scope_payload() {
        let h = harness();
        let mut body = pull_request_body("opened", 42, 7);
        body.as_object_mut().unwrap().remove("repository");

        let result = send(&h, "pull_request", body.to_string().as_bytes()).await;
        assert!(matches!(
            result,
            Err(IngestError::Malformed(PayloadError::MissingField("repository")))
        ));
    }

    #[tokio::test]
    async fn test_store_outage_is_an_infrastructure_error() {
        let h = harness();
        h.store.set_available(false);
        let body = pull_request_body("opened", 42, 7).to_string();

        let result = send(&h, "pull_request", body.as_bytes()).await;
        assert!(matches!(result, Err(IngestError::Store(_))));
        assert_eq!(h.queue.stats().await.unwrap().waiting, 0);
    }

    #[tokio::test]
    async fn test_new_push_reopens_completed_job() {
        let h = harness();
        let body = pull_request_body("opened", 42, 7).to_string();
        send(&h, "pull_request", body.as_bytes()).await.unwrap();

        let lease = h.queue.try_dequeue().await.unwrap().unwrap();
        let job = h.store.get_job_by_key(&lease.job_key).await.unwrap().unwrap();
        h.store
            .transition_job(
                job.id,
                &crate::state_machine::JobTransition {
                    status: JobStatus::Completed,
                    attempts: 1,
                    error: None,
                    completed_at: Some(chrono::Utc::now()),
                },
            )
            .await
            .unwrap();
        h.queue.ack(&lease).await.unwrap();

        let body = pull_request_body("synchronize", 42, 7).to_string();
        let outcome = send(&h, "pull_request", body.as_bytes()).await.unwrap();
        assert!(matches!(
            outcome,
            IngestOutcome::Accepted {
                enqueue: EnqueueOutcome::Enqueued,
                ..
            }
        ));

        let job = h.store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_event_between_outcome_and_ack_keeps_job_queued() {
        let h = harness();
        let tracker = JobTracker::new(h.store.clone());
        let key = JobKey::new(42, 7);
        let opened = pull_request_body("opened", 42, 7).to_string();
        send(&h, "pull_request", opened.as_bytes()).await.unwrap();

        let lease = h.queue.try_dequeue().await.unwrap().unwrap();
        tracker.apply_by_key(&key, JobEvent::AttemptStarted).await.unwrap();
        tracker.apply_by_key(&key, JobEvent::AttemptSucceeded).await.unwrap();

        // The worker has recorded the outcome but not yet acked.
        let synchronize = pull_request_body("synchronize", 42, 7).to_string();
        let outcome = send(&h, "pull_request", synchronize.as_bytes()).await.unwrap();
        assert!(matches!(
            outcome,
            IngestOutcome::Accepted {
                enqueue: EnqueueOutcome::Requeued,
                ..
            }
        ));
        h.queue.ack(&lease).await.unwrap();

        let job = h.store.get_job_by_key(&key).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        let stats = h.queue.stats().await.unwrap();
        assert_eq!(stats.waiting, 1);
        assert_eq!(stats.completed, 0);

        let next = h.queue.try_dequeue().await.unwrap().unwrap();
        assert_eq!(next.job_key, key);
        assert_eq!(next.attempt, 1);
        let job = tracker.apply_by_key(&key, JobEvent::AttemptStarted).await.unwrap();
        assert_eq!(job.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn test_event_between_failure_and_fail_keeps_job_queued() {
        let h = harness();
        let tracker = JobTracker::new(h.store.clone());
        let key = JobKey::new(42, 7);
        let opened = pull_request_body("opened", 42, 7).to_string();
        send(&h, "pull_request", opened.as_bytes()).await.unwrap();

        let lease = h.queue.try_dequeue().await.unwrap().unwrap();
        tracker.apply_by_key(&key, JobEvent::AttemptStarted).await.unwrap();
        let failed = JobEvent::AttemptFailed {
            error: "upstream returned 502".to_string(),
        };
        tracker.apply_by_key(&key, failed).await.unwrap();

        let synchronize = pull_request_body("synchronize", 42, 7).to_string();
        send(&h, "pull_request", synchronize.as_bytes()).await.unwrap();
        let outcome = h.queue.fail(&lease, "upstream returned 502").await.unwrap();
        assert_eq!(outcome, FailOutcome::Requeued);

        let job = h.store.get_job_by_key(&key).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        let next = h.queue.try_dequeue().await.unwrap().unwrap();
        assert_eq!(next.attempt, 1);
    }
}
