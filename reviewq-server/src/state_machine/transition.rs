//! Pure state transition function.
//!
//! Takes the current job and an event and returns the fields to write. No
//! side effects; the tracker applies the result through the record store.

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::event::JobEvent;
use super::state::{Job, JobStatus, JobTransition};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{event} is not valid for a job in state {from}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub event: &'static str,
}

/// Compute the next lifecycle fields for `job` after `event`.
///
/// - `AttemptStarted` is accepted from `pending`, from `failed` (redelivery
///   after a failed attempt) and from `processing` (redelivery after a lost
///   lease). It always bumps `attempts`.
/// - The outcome events are only accepted while `processing`.
/// - `completed_at` keeps whatever value the job already has.
pub fn transition(
    job: &Job,
    event: &JobEvent,
    now: DateTime<Utc>,
) -> Result<JobTransition, TransitionError> {
    use JobStatus::*;

    let invalid = || TransitionError {
        from: job.status,
        event: event.name(),
    };

    match (job.status, event) {
        (Pending | Failed | Processing, JobEvent::AttemptStarted) => Ok(JobTransition {
            status: Processing,
            attempts: job.attempts.saturating_add(1),
            error: job.error.clone(),
            completed_at: job.completed_at,
        }),

        (Processing, JobEvent::AttemptSucceeded) => Ok(JobTransition {
            status: Completed,
            attempts: job.attempts,
            error: None,
            completed_at: job.completed_at.or(Some(now)),
        }),

        (Processing, JobEvent::AttemptFailed { error } | JobEvent::LeaseExpired { error }) => {
            Ok(JobTransition {
                status: Failed,
                attempts: job.attempts,
                error: Some(error.clone()),
                completed_at: job.completed_at,
            })
        }

        (Completed, JobEvent::AttemptStarted)
        | (Pending | Completed | Failed, JobEvent::AttemptSucceeded)
        | (Pending | Completed | Failed, JobEvent::AttemptFailed { .. })
        | (Pending | Completed | Failed, JobEvent::LeaseExpired { .. }) => Err(invalid()),
    }
}
