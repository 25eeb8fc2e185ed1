//! Durable job queue with at-least-once delivery.
//!
//! Entries are keyed by `JobKey`: at most one live entry (waiting, active or
//! retrying) exists per key. A delivered entry is held under a lease; the
//! holder must ack or fail it before the lease expires, otherwise the queue
//! treats the delivery as failed and redelivers (or dead-letters) the entry.
//!
//! Enqueueing for a key whose entry is active marks the entry for requeue:
//! when the lease is settled (ack, fail or expiry) the entry returns to
//! waiting instead of finishing, so work recorded after the delivery began
//! always has a live entry behind it.
//!
//! Every delivery carries a fresh lease token. Ack and fail only take effect
//! when the token still matches, so a worker that lost its lease can never
//! complete or fail someone else's delivery.

mod sqlite;

pub use sqlite::SqliteQueue;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::db::DbSetupError;
use crate::ids::JobKey;


#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue error during {operation}: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },

    #[error("corrupt {0} in queue")]
    Corruption(String),

    /// The lease was reclaimed (expired and redelivered or dead-lettered)
    /// before the holder reported back.
    #[error("lease on {job_key} is no longer held")]
    LeaseLost { job_key: JobKey },
}

impl QueueError {
    pub fn storage(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Storage {
            operation,
            message: message.into(),
        }
    }
}

impl From<DbSetupError> for QueueError {
    fn from(e: DbSetupError) -> Self {
        Self::Storage {
            operation: e.operation,
            message: e.message,
        }
    }
}

/// Exponential backoff between deliveries of the same entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Deliveries per entry before it is dead-lettered.
    pub max_attempts: u32,
    /// Delay after the first failed delivery; doubles after each further one.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before redelivery after `attempt` (1-based) failed deliveries.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.checked_mul(factor).unwrap_or(Duration::MAX)
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How long a delivery may run before the queue takes it back.
    pub lease_duration: Duration,
    /// Upper bound on how long an idle consumer waits before polling again.
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
    /// How long completed entries are kept before pruning.
    pub completed_retention: Duration,
    /// How long dead-lettered entries are kept before pruning.
    pub failed_retention: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(600),
            poll_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            completed_retention: Duration::from_secs(60 * 60),
            failed_retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// A delivered entry, held until acked or failed.
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub entry_id: i64,
    pub job_key: JobKey,
    pub payload: serde_json::Value,
    /// 1-based delivery number of this entry.
    pub attempt: u32,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new entry was created.
    Enqueued,
    /// A waiting or retrying entry for the key already existed; its payload
    /// was replaced with the newer one.
    Merged,
    /// An entry for the key is being processed right now. The newer payload
    /// is stored and the entry goes back to waiting, with a fresh delivery
    /// budget, once the current lease is settled.
    Requeued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying {
        attempt: u32,
        retry_at: DateTime<Utc>,
    },
    DeadLettered {
        attempts: u32,
    },
    /// New work arrived during the failed delivery; the entry is waiting
    /// again with a fresh delivery budget.
    Requeued,
}

/// An active entry whose lease ran out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReapedEntry {
    pub job_key: JobKey,
    pub attempts: u32,
    pub dead_lettered: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add work for `job_key`, deduplicating against any live entry.
    async fn enqueue(
        &self,
        job_key: &JobKey,
        payload: &serde_json::Value,
    ) -> Result<EnqueueOutcome, QueueError>;

    /// Lease the oldest available entry, if any.
    async fn try_dequeue(&self) -> Result<Option<Lease>, QueueError>;

    /// Mark the delivery as done.
    async fn ack(&self, lease: &Lease) -> Result<(), QueueError>;

    /// Mark the delivery as failed; the entry is retried after a backoff or,
    /// once out of attempts, dead-lettered.
    async fn fail(&self, lease: &Lease, reason: &str) -> Result<FailOutcome, QueueError>;

    /// Take back every expired lease, treating each as a failed delivery.
    async fn reap_expired(&self) -> Result<Vec<ReapedEntry>, QueueError>;

    /// Drop finished entries older than their retention. Returns the number
    /// of entries removed.
    async fn prune(&self) -> Result<u64, QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;

    async fn ping(&self) -> Result<(), QueueError>;

    /// Resolves when new work may be available, or after the poll interval.
    async fn wait_for_work(&self);

    /// Block until an entry can be leased or `cancel` fires.
    async fn dequeue(&self, cancel: &CancellationToken) -> Result<Option<Lease>, QueueError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            if let Some(lease) = self.try_dequeue().await? {
                return Ok(Some(lease));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = self.wait_for_work() => {}
            }
        }
    }
}
