//! Job lifecycle state.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ChangeRequestId, JobId, JobKey};

/// Where a job is in its lifecycle.
///
/// ```text
/// pending ──► processing ──► completed
///                 │  ▲
///                 ▼  │ (redelivery)
///               failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Terminal for the current review cycle. A new in-scope event reopens
    /// the job.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The review work for one change-request, as persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    pub change_request_id: ChangeRequestId,
    pub job_key: JobKey,
    pub status: JobStatus,
    /// Execution attempts started over the job's whole life. Never decreases.
    pub attempts: u32,
    /// Detail of the last failure, if any.
    pub error: Option<String>,
    /// Set by the first successful completion and never rewritten.
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The lifecycle fields written by a single transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTransition {
    pub status: JobStatus,
    pub attempts: u32,
    pub error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}
