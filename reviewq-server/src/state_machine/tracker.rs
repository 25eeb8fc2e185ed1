//! Applies job events against the record store.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::debug;

use super::event::JobEvent;
use super::state::Job;
use super::transition::{transition, TransitionError};
use crate::ids::{JobId, JobKey};
use crate::store::{RecordStore, StoreError};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("job {0} not found")]
    NotFound(String),
}

/// Reads a job, runs the pure transition and writes the result.
///
/// The read and the write are separate store calls. That is fine because a
/// job only ever has one worker holding its queue lease; the store's
/// monotonic `attempts`/`completed_at` update covers the rest.
#[derive(Clone)]
pub struct JobTracker {
    store: Arc<dyn RecordStore>,
}

impl JobTracker {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub async fn apply(&self, id: JobId, event: JobEvent) -> Result<Job, TrackerError> {
        let job = self
            .store
            .get_job(id)
            .await?
            .ok_or_else(|| TrackerError::NotFound(id.to_string()))?;
        self.apply_to(job, event).await
    }

    pub async fn apply_by_key(&self, key: &JobKey, event: JobEvent) -> Result<Job, TrackerError> {
        let job = self
            .store
            .get_job_by_key(key)
            .await?
            .ok_or_else(|| TrackerError::NotFound(key.to_string()))?;
        self.apply_to(job, event).await
    }

    async fn apply_to(&self, mut job: Job, event: JobEvent) -> Result<Job, TrackerError> {
        let now = Utc::now();
        let next = transition(&job, &event, now)?;

        debug!(
            "Job {} ({}): {} --{}--> {}",
            job.id,
            job.job_key,
            job.status,
            event.name(),
            next.status
        );

        self.store.transition_job(job.id, &next).await?;

        job.status = next.status;
        job.attempts = job.attempts.max(next.attempts);
        job.error = next.error;
        job.completed_at = job.completed_at.or(next.completed_at);
        job.updated_at = now;
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::JobStatus;
    use crate::store::{
        ChangeRequestState, ChangeRequestUpsert, InMemoryRecordStore, RepositoryUpsert,
    };

    async fn setup() -> (JobTracker, Arc<InMemoryRecordStore>, JobId) {
        let store = Arc::new(InMemoryRecordStore::new());
        let repo = store
            .upsert_repository(&RepositoryUpsert {
                external_id: 42,
                owner: "o".to_string(),
                name: "r".to_string(),
                installation_id: None,
            })
            .await
            .unwrap();
        let cr = store
            .upsert_change_request(
                repo,
                &ChangeRequestUpsert {
                    number: 7,
                    title: "t".to_string(),
                    author: "a".to_string(),
                    state: ChangeRequestState::Open,
                    head_sha: "abc".to_string(),
                },
            )
            .await
            .unwrap();
        let job = store
            .upsert_job_pending(cr, &JobKey::new(42, 7))
            .await
            .unwrap();
        (JobTracker::new(store.clone()), store, job)
    }

    #[tokio::test]
    async fn test_happy_path_is_persisted() {
        let (tracker, store, id) = setup().await;

        let job = tracker.apply(id, JobEvent::AttemptStarted).await.unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.attempts, 1);

        tracker.apply(id, JobEvent::AttemptSucceeded).await.unwrap();

        let stored = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.attempts, 1);
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_invalid_event_leaves_job_untouched() {
        let (tracker, store, id) = setup().await;

        let err = tracker
            .apply(id, JobEvent::AttemptSucceeded)
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::Transition(_)));

        let stored = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_apply_by_key() {
        let (tracker, _store, _) = setup().await;
        let job = tracker
            .apply_by_key(&JobKey::new(42, 7), JobEvent::AttemptStarted)
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Processing);

        let missing = tracker
            .apply_by_key(&JobKey::new(1, 1), JobEvent::AttemptStarted)
            .await;
        assert!(matches!(missing, Err(TrackerError::NotFound(_))));
    }
}
