//! In-memory implementation of `RecordStore`.
//!
//! Mirrors the SQLite semantics so tests can run without a database. It can
//! also be switched offline to exercise the infrastructure-failure paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use reviewq_core::Analysis;
use tokio::sync::RwLock;

use super::{
    ChangeRequestUpsert, JobCounts, RecordStore, RepositoryUpsert, StoreError,
    StoredReview,
};
use crate::ids::{ChangeRequestId, JobId, JobKey, RepositoryId};
use crate::state_machine::{Job, JobStatus, JobTransition};

struct ChangeRequestRow {
    id: ChangeRequestId,
    repository_id: RepositoryId,
    number: u64,
}

#[derive(Default)]
struct Tables {
    next_id: i64,
    /// Keyed by external id.
    repositories: HashMap<u64, (RepositoryId, RepositoryUpsert)>,
    change_requests: HashMap<ChangeRequestId, ChangeRequestRow>,
    jobs: HashMap<JobId, Job>,
    reviews: Vec<StoredReview>,
}

impl Tables {
    fn allocate(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

pub struct InMemoryRecordStore {
    tables: RwLock<Tables>,
    available: AtomicBool,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the backing store going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable)
        }
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn upsert_repository(&self, repo: &RepositoryUpsert) -> Result<RepositoryId, StoreError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        if let Some((id, existing)) = tables.repositories.get_mut(&repo.external_id) {
            let installation_id = repo.installation_id.or(existing.installation_id);
            *existing = RepositoryUpsert {
                installation_id,
                ..repo.clone()
            };
            return Ok(*id);
        }
        let id = RepositoryId(tables.allocate());
        tables
            .repositories
            .insert(repo.external_id, (id, repo.clone()));
        Ok(id)
    }

    async fn upsert_change_request(
        &self,
        repository_id: RepositoryId,
        change: &ChangeRequestUpsert,
    ) -> Result<ChangeRequestId, StoreError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        if !tables
            .repositories
            .values()
            .any(|(id, _)| *id == repository_id)
        {
            return Err(StoreError::storage(
                "upsert_change_request",
                "FOREIGN KEY constraint failed",
            ));
        }

        let existing = tables
            .change_requests
            .values()
            .find(|cr| cr.repository_id == repository_id && cr.number == change.number)
            .map(|cr| cr.id);
        let id = match existing {
            Some(id) => id,
            None => ChangeRequestId(tables.allocate()),
        };
        tables.change_requests.insert(
            id,
            ChangeRequestRow {
                id,
                repository_id,
                number: change.number,
            },
        );
        Ok(id)
    }

    async fn upsert_job_pending(
        &self,
        change_request_id: ChangeRequestId,
        job_key: &JobKey,
    ) -> Result<JobId, StoreError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        let now = Utc::now();

        if let Some(job) = tables
            .jobs
            .values_mut()
            .find(|j| j.change_request_id == change_request_id)
        {
            if job.status.is_terminal() {
                job.status = JobStatus::Pending;
                job.error = None;
            }
            job.updated_at = now;
            return Ok(job.id);
        }

        let id = JobId(tables.allocate());
        tables.jobs.insert(
            id,
            Job {
                id,
                change_request_id,
                job_key: job_key.clone(),
                status: JobStatus::Pending,
                attempts: 0,
                error: None,
                completed_at: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.check()?;
        Ok(self.tables.read().await.jobs.get(&id).cloned())
    }

    async fn get_job_by_key(&self, job_key: &JobKey) -> Result<Option<Job>, StoreError> {
        self.check()?;
        Ok(self
            .tables
            .read()
            .await
            .jobs
            .values()
            .find(|j| &j.job_key == job_key)
            .cloned())
    }

    async fn transition_job(&self, id: JobId, transition: &JobTransition) -> Result<(), StoreError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        let job = tables.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
        job.status = transition.status;
        job.attempts = job.attempts.max(transition.attempts);
        job.error = transition.error.clone();
        if job.completed_at.is_none() {
            job.completed_at = transition.completed_at;
        }
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn save_review(
        &self,
        job_id: JobId,
        head_sha: &str,
        analysis: &Analysis,
    ) -> Result<(), StoreError> {
        self.check()?;
        self.tables.write().await.reviews.push(StoredReview {
            job_id,
            head_sha: head_sha.to_string(),
            analysis: analysis.clone(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn latest_review(&self, job_id: JobId) -> Result<Option<StoredReview>, StoreError> {
        self.check()?;
        Ok(self
            .tables
            .read()
            .await
            .reviews
            .iter()
            .rev()
            .find(|r| r.job_id == job_id)
            .cloned())
    }

    async fn job_counts(&self) -> Result<JobCounts, StoreError> {
        self.check()?;
        let tables = self.tables.read().await;
        let mut counts = JobCounts::default();
        for job in tables.jobs.values() {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Processing => counts.processing += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn delete_repository(&self, external_id: u64) -> Result<bool, StoreError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        let Some((repository_id, _)) = tables.repositories.remove(&external_id) else {
            return Ok(false);
        };

        let change_requests: Vec<ChangeRequestId> = tables
            .change_requests
            .values()
            .filter(|cr| cr.repository_id == repository_id)
            .map(|cr| cr.id)
            .collect();
        tables
            .change_requests
            .retain(|_, cr| cr.repository_id != repository_id);

        let jobs: Vec<JobId> = tables
            .jobs
            .values()
            .filter(|j| change_requests.contains(&j.change_request_id))
            .map(|j| j.id)
            .collect();
        tables.jobs.retain(|id, _| !jobs.contains(id));
        tables.reviews.retain(|r| !jobs.contains(&r.job_id));

        Ok(true)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }
}
