//! Events that drive a job through its lifecycle.
//!
//! Every event comes from the worker side. Ingestion never emits events; it
//! only (re)opens a job to `pending` through the record store.

/// Something that happened to a job's current attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    /// A worker received the job from the queue and is about to run it.
    AttemptStarted,

    /// The analysis was persisted and the result published.
    AttemptSucceeded,

    /// The attempt failed at some step.
    AttemptFailed { error: String },

    /// The worker holding the job stopped renewing its lease and the queue
    /// gave up on the entry.
    LeaseExpired { error: String },
}

impl JobEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AttemptStarted => "AttemptStarted",
            Self::AttemptSucceeded => "AttemptSucceeded",
            Self::AttemptFailed { .. } => "AttemptFailed",
            Self::LeaseExpired { .. } => "LeaseExpired",
        }
    }
}
