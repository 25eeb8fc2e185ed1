//! Record store abstraction: the durable record of truth.
//!
//! The `RecordStore` trait is everything the ingestion path and the workers
//! need from persistence. Implementations provide the backend (SQLite for
//! production, in-memory for tests).
//!
//! Every write is a single atomic operation keyed by a natural key or a
//! surrogate id. Nothing here does read-then-write across calls, so two
//! deliveries of the same event racing each other still converge on one row.

mod memory;
mod sqlite;

pub use memory::InMemoryRecordStore;
pub use sqlite::SqliteRecordStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reviewq_core::Analysis;
use thiserror::Error;

use crate::db::DbSetupError;
use crate::ids::{ChangeRequestId, JobId, JobKey, RepositoryId};
use crate::state_machine::{Job, JobTransition};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record store error during {operation}: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },

    #[error("corrupt {0} in record store")]
    Corruption(String),

    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("record store unavailable")]
    Unavailable,
}

impl StoreError {
    pub fn storage(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Storage {
            operation,
            message: message.into(),
        }
    }

    pub fn corruption(what: impl Into<String>) -> Self {
        Self::Corruption(what.into())
    }
}

impl From<DbSetupError> for StoreError {
    fn from(e: DbSetupError) -> Self {
        Self::Storage {
            operation: e.operation,
            message: e.message,
        }
    }
}

/// Mutable repository fields, keyed by the upstream repository id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryUpsert {
    pub external_id: u64,
    pub owner: String,
    pub name: String,
    pub installation_id: Option<u64>,
}

impl RepositoryUpsert {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeRequestState {
    Open,
    Closed,
    Merged,
}

impl ChangeRequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Merged => "merged",
        }
    }
}

/// Mutable change-request fields, keyed by (repository, number).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRequestUpsert {
    pub number: u64,
    pub title: String,
    pub author: String,
    pub state: ChangeRequestState,
    pub head_sha: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredReview {
    pub job_id: JobId,
    pub head_sha: String,
    pub analysis: Analysis,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or update a repository by its external id. Returns the stable
    /// internal id; the external id itself is never rewritten.
    async fn upsert_repository(&self, repo: &RepositoryUpsert) -> Result<RepositoryId, StoreError>;

    /// Insert or update a change-request by (repository, number).
    async fn upsert_change_request(
        &self,
        repository_id: RepositoryId,
        change: &ChangeRequestUpsert,
    ) -> Result<ChangeRequestId, StoreError>;

    /// Ensure a job exists for the change-request.
    ///
    /// A new job starts `pending` with zero attempts. An existing job in a
    /// terminal state (`completed`/`failed`) is reopened to `pending` for the
    /// new review cycle; `attempts` and `completed_at` are kept. A job that is
    /// already `pending` or `processing` is left alone.
    async fn upsert_job_pending(
        &self,
        change_request_id: ChangeRequestId,
        job_key: &JobKey,
    ) -> Result<JobId, StoreError>;

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    async fn get_job_by_key(&self, job_key: &JobKey) -> Result<Option<Job>, StoreError>;

    /// Point-in-time update of a job's lifecycle fields by id.
    ///
    /// The store enforces the invariants even against a buggy caller:
    /// `attempts` never decreases and `completed_at` is only ever written once.
    async fn transition_job(&self, id: JobId, transition: &JobTransition) -> Result<(), StoreError>;

    /// Persist the result of a successful analysis.
    async fn save_review(
        &self,
        job_id: JobId,
        head_sha: &str,
        analysis: &Analysis,
    ) -> Result<(), StoreError>;

    /// The most recently saved review for a job, if any.
    async fn latest_review(&self, job_id: JobId) -> Result<Option<StoredReview>, StoreError>;

    async fn job_counts(&self) -> Result<JobCounts, StoreError>;

    /// Administrative removal of a repository and everything that hangs off
    /// it. Returns false if the repository was unknown.
    async fn delete_repository(&self, external_id: u64) -> Result<bool, StoreError>;

    /// Cheap reachability check for health probes.
    async fn ping(&self) -> Result<(), StoreError>;
}
