//! Review workers.
//!
//! Each worker loops on the queue: lease an entry, move the job to
//! `processing`, run fetch → analyze → persist → publish, then record the
//! outcome on the job and settle the lease. Workers never retry on their
//! own; a failed attempt goes back to the queue, which owns backoff and
//! dead-lettering.
//!
//! A redelivery whose change head has not moved reuses the last saved
//! analysis, so an attempt that only failed to publish is not analyzed twice.

use std::sync::Arc;

use anyhow::{Context, Result};
use reviewq_core::{render_review_comment, Analysis};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collaborators::{Analyzer, ChangeSource, RepoRef, ResultPublisher};
use crate::ids::JobId;
use crate::payload::ReviewPayload;
use crate::queue::{FailOutcome, JobQueue, Lease, QueueError};
use crate::state_machine::{JobEvent, JobTracker, TrackerError};
use crate::store::RecordStore;

#[cfg(test)]
mod tests;

/// Pause after a queue error before the next dequeue.
const QUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// The external services one review attempt talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn ChangeSource>,
    pub analyzer: Arc<dyn Analyzer>,
    pub publisher: Arc<dyn ResultPublisher>,
}

/// How a single lease was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed,
    Failed(FailOutcome),
    /// Nothing to do for this entry (job gone or not runnable); acked.
    Skipped,
    /// The lease was reclaimed before the worker could settle it.
    LeaseLost,
    /// The queue could not record the outcome.
    Unsettled,
}

pub struct Worker {
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn RecordStore>,
    tracker: JobTracker,
    collaborators: Collaborators,
    version: String,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn RecordStore>,
        collaborators: Collaborators,
        version: impl Into<String>,
    ) -> Self {
        Self {
            tracker: JobTracker::new(store.clone()),
            queue,
            store,
            collaborators,
            version: version.into(),
        }
    }

    /// Dequeue and process until `cancel` fires. An in-flight lease is always
    /// finished before returning.
    pub async fn run(&self, worker_id: usize, cancel: CancellationToken) {
        info!(worker_id, "Worker started");

        loop {
            let lease = match self.queue.dequeue(&cancel).await {
                Ok(Some(lease)) => lease,
                Ok(None) => break,
                Err(e) => {
                    error!(worker_id, "Failed to dequeue: {}", e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(QUEUE_ERROR_BACKOFF) => continue,
                    }
                }
            };

            let outcome = self.process(&lease).await;
            debug!(worker_id, job_key = %lease.job_key, ?outcome, "Lease settled");
        }

        info!(worker_id, "Worker stopped");
    }

    pub async fn process(&self, lease: &Lease) -> ProcessOutcome {
        let payload: ReviewPayload = match serde_json::from_value(lease.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                error!(job_key = %lease.job_key, "Undecodable queue payload: {}", e);
                return self
                    .fail_lease(lease, &format!("undecodable payload: {}", e))
                    .await;
            }
        };

        let job = match self
            .tracker
            .apply_by_key(&lease.job_key, JobEvent::AttemptStarted)
            .await
        {
            Ok(job) => job,
            Err(TrackerError::NotFound(_)) => {
                warn!(job_key = %lease.job_key, "No job for queue entry, dropping it");
                return self.ack_lease(lease, ProcessOutcome::Skipped).await;
            }
            Err(TrackerError::Transition(e)) => {
                warn!(job_key = %lease.job_key, "Job not runnable: {}", e);
                return self.ack_lease(lease, ProcessOutcome::Skipped).await;
            }
            Err(TrackerError::Store(e)) => {
                error!(job_key = %lease.job_key, "Could not start job: {}", e);
                return self.fail_lease(lease, &e.to_string()).await;
            }
        };

        info!(
            job_key = %lease.job_key,
            attempt = job.attempts,
            delivery = payload.delivery_id.as_deref().unwrap_or("-"),
            "Processing review for {}#{}",
            payload.repo_full_name(),
            payload.number
        );

        match self.execute(job.id, lease.attempt, &payload).await {
            Ok(()) => {
                if let Err(e) = self.tracker.apply(job.id, JobEvent::AttemptSucceeded).await {
                    error!(job_key = %lease.job_key, "Could not mark job completed: {}", e);
                    return self.fail_lease(lease, &e.to_string()).await;
                }
                info!(job_key = %lease.job_key, "Review completed");
                self.ack_lease(lease, ProcessOutcome::Completed).await
            }
            Err(e) => {
                let reason = format!("{:#}", e);
                warn!(job_key = %lease.job_key, attempt = job.attempts, "Review failed: {}", reason);
                let event = JobEvent::AttemptFailed {
                    error: reason.clone(),
                };
                if let Err(e) = self.tracker.apply(job.id, event).await {
                    error!(job_key = %lease.job_key, "Could not mark job failed: {}", e);
                }
                self.fail_lease(lease, &reason).await
            }
        }
    }

    async fn execute(&self, job_id: JobId, delivery: u32, payload: &ReviewPayload) -> Result<()> {
        let correlation_id = payload.delivery_id.as_deref();
        let repo = RepoRef {
            owner: payload.repo_owner.clone(),
            name: payload.repo_name.clone(),
            installation_id: payload.installation_id,
        };

        let change = self
            .collaborators
            .source
            .fetch_change(correlation_id, &repo, payload.number)
            .await
            .context("Failed to fetch change")?;

        let saved = if delivery > 1 {
            self.saved_analysis(job_id, &change.metadata.head_sha).await?
        } else {
            None
        };

        let analysis = match saved {
            Some(analysis) => {
                info!(job_id = %job_id, head_sha = %change.metadata.head_sha, "Reusing saved analysis");
                analysis
            }
            None => {
                let analysis = self
                    .collaborators
                    .analyzer
                    .analyze(correlation_id, &change.metadata, &change.changed_files)
                    .await
                    .context("Failed to analyze change")?;

                self.store
                    .save_review(job_id, &change.metadata.head_sha, &analysis)
                    .await
                    .context("Failed to persist review")?;
                analysis
            }
        };

        let rendered = render_review_comment(&analysis, &change.metadata, &self.version);
        self.collaborators
            .publisher
            .publish_result(correlation_id, &repo, payload.number, &rendered)
            .await
            .context("Failed to publish review")?;

        Ok(())
    }

    async fn saved_analysis(&self, job_id: JobId, head_sha: &str) -> Result<Option<Analysis>> {
        let review = self
            .store
            .latest_review(job_id)
            .await
            .context("Failed to load saved review")?;
        Ok(review
            .filter(|review| review.head_sha == head_sha)
            .map(|review| review.analysis))
    }

    async fn ack_lease(&self, lease: &Lease, outcome: ProcessOutcome) -> ProcessOutcome {
        match self.queue.ack(lease).await {
            Ok(()) => outcome,
            Err(e) => settle_error(lease, e),
        }
    }

    async fn fail_lease(&self, lease: &Lease, reason: &str) -> ProcessOutcome {
        match self.queue.fail(lease, reason).await {
            Ok(outcome) => {
                if let FailOutcome::DeadLettered { attempts } = outcome {
                    error!(job_key = %lease.job_key, attempts, "Giving up on job");
                }
                ProcessOutcome::Failed(outcome)
            }
            Err(e) => settle_error(lease, e),
        }
    }
}

fn settle_error(lease: &Lease, e: QueueError) -> ProcessOutcome {
    match e {
        QueueError::LeaseLost { .. } => {
            warn!(job_key = %lease.job_key, "Lease lost before it was settled");
            ProcessOutcome::LeaseLost
        }
        e => {
            error!(job_key = %lease.job_key, "Failed to settle lease: {}", e);
            ProcessOutcome::Unsettled
        }
    }
}

/// A fixed set of worker tasks sharing one `Worker`.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(worker: Arc<Worker>, concurrency: usize, cancel: CancellationToken) -> Self {
        let handles = (0..concurrency)
            .map(|worker_id| {
                let worker = worker.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { worker.run(worker_id, cancel).await })
            })
            .collect();
        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker to stop.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Worker task panicked: {}", e);
            }
        }
    }
}
