//! SQLite implementation of `RecordStore`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use reviewq_core::{Analysis, Issue};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{
    ChangeRequestUpsert, JobCounts, RecordStore, RepositoryUpsert, StoreError, StoredReview,
};
use crate::db::{dt_to_ms, ms_to_dt, open_database, Migration};
use crate::ids::{ChangeRequestId, JobId, JobKey, RepositoryId};
use crate::state_machine::{Job, JobStatus, JobTransition};


const MIGRATIONS: &[Migration] = &[(
    1,
    r#"
    CREATE TABLE repositories (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        external_id INTEGER NOT NULL UNIQUE,
        owner TEXT NOT NULL,
        name TEXT NOT NULL,
        installation_id INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE TABLE change_requests (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        repository_id INTEGER NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
        number INTEGER NOT NULL,
        title TEXT NOT NULL,
        author TEXT NOT NULL,
        state TEXT NOT NULL CHECK (state IN ('open', 'closed', 'merged')),
        head_sha TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        UNIQUE (repository_id, number)
    );

    CREATE TABLE jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        change_request_id INTEGER NOT NULL UNIQUE
            REFERENCES change_requests(id) ON DELETE CASCADE,
        job_key TEXT NOT NULL UNIQUE,
        status TEXT NOT NULL
            CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
        attempts INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
        error TEXT,
        completed_at INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );
    CREATE INDEX idx_jobs_status ON jobs(status);

    CREATE TABLE reviews (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
        head_sha TEXT NOT NULL,
        summary TEXT NOT NULL,
        issues_json TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );
    CREATE INDEX idx_reviews_job ON reviews(job_id, id DESC);
    "#,
)];

const JOB_COLUMNS: &str =
    "id, change_request_id, job_key, status, attempts, error, completed_at, created_at, updated_at";

/// SQLite-backed record store.
///
/// Runs synchronous rusqlite calls on the blocking pool. A single connection
/// behind a mutex serialises writers, which is what SQLite does anyway.
pub struct SqliteRecordStore {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl SqliteRecordStore {
    /// Open (creating and migrating as needed) the record store at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = open_database(path, MIGRATIONS)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn new_in_memory() -> Result<Self, StoreError> {
        Self::new(":memory:")
    }

    async fn run<T, F>(&self, operation: &'static str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| StoreError::storage(operation, "connection mutex poisoned"))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::storage(operation, format!("task join error: {}", e)))?
    }
}

fn to_i64(value: u64, operation: &'static str) -> Result<i64, StoreError> {
    i64::try_from(value)
        .map_err(|_| StoreError::storage(operation, format!("{} exceeds i64::MAX", value)))
}

fn sql_err(operation: &'static str) -> impl Fn(rusqlite::Error) -> StoreError {
    move |e| StoreError::storage(operation, e.to_string())
}

/// Raw column values of a job row; decoded outside the rusqlite closure so
/// corruption surfaces as a `StoreError` rather than a SQL error.
struct JobRow {
    id: i64,
    change_request_id: i64,
    job_key: String,
    status: String,
    attempts: i64,
    error: Option<String>,
    completed_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            change_request_id: row.get(1)?,
            job_key: row.get(2)?,
            status: row.get(3)?,
            attempts: row.get(4)?,
            error: row.get(5)?,
            completed_at: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn into_job(self) -> Result<Job, StoreError> {
        let status = JobStatus::parse(&self.status)
            .ok_or_else(|| StoreError::corruption(format!("job status '{}'", self.status)))?;
        let job_key: JobKey = self
            .job_key
            .parse()
            .map_err(|_| StoreError::corruption(format!("job key '{}'", self.job_key)))?;
        let attempts = u32::try_from(self.attempts)
            .map_err(|_| StoreError::corruption(format!("job attempts {}", self.attempts)))?;

        Ok(Job {
            id: JobId(self.id),
            change_request_id: ChangeRequestId(self.change_request_id),
            job_key,
            status,
            attempts,
            error: self.error,
            completed_at: self.completed_at.map(ms_to_dt),
            created_at: ms_to_dt(self.created_at),
            updated_at: ms_to_dt(self.updated_at),
        })
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn upsert_repository(&self, repo: &RepositoryUpsert) -> Result<RepositoryId, StoreError> {
        const OP: &str = "upsert_repository";
        let external_id = to_i64(repo.external_id, OP)?;
        let installation_id = repo.installation_id.map(|i| to_i64(i, OP)).transpose()?;
        let owner = repo.owner.clone();
        let name = repo.name.clone();
        let now = dt_to_ms(Utc::now());

        self.run(OP, move |conn| {
            conn.query_row(
                "INSERT INTO repositories (external_id, owner, name, installation_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(external_id) DO UPDATE SET
                     owner = excluded.owner,
                     name = excluded.name,
                     installation_id = COALESCE(excluded.installation_id, repositories.installation_id),
                     updated_at = excluded.updated_at
                 RETURNING id",
                params![external_id, owner, name, installation_id, now],
                |row| row.get(0),
            )
            .map(RepositoryId)
            .map_err(sql_err(OP))
        })
        .await
    }

    async fn upsert_change_request(
        &self,
        repository_id: RepositoryId,
        change: &ChangeRequestUpsert,
    ) -> Result<ChangeRequestId, StoreError> {
        const OP: &str = "upsert_change_request";
        let number = to_i64(change.number, OP)?;
        let title = change.title.clone();
        let author = change.author.clone();
        let state = change.state.as_str();
        let head_sha = change.head_sha.clone();
        let now = dt_to_ms(Utc::now());

        self.run(OP, move |conn| {
            conn.query_row(
                "INSERT INTO change_requests
                     (repository_id, number, title, author, state, head_sha, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                 ON CONFLICT(repository_id, number) DO UPDATE SET
                     title = excluded.title,
                     author = excluded.author,
                     state = excluded.state,
                     head_sha = excluded.head_sha,
                     updated_at = excluded.updated_at
                 RETURNING id",
                params![repository_id.0, number, title, author, state, head_sha, now],
                |row| row.get(0),
            )
            .map(ChangeRequestId)
            .map_err(sql_err(OP))
        })
        .await
    }

    async fn upsert_job_pending(
        &self,
        change_request_id: ChangeRequestId,
        job_key: &JobKey,
    ) -> Result<JobId, StoreError> {
        const OP: &str = "upsert_job_pending";
        let key = job_key.to_string();
        let now = dt_to_ms(Utc::now());

        // Column references on the right of SET see the pre-update row.
        self.run(OP, move |conn| {
            conn.query_row(
                "INSERT INTO jobs (change_request_id, job_key, status, attempts, created_at, updated_at)
                 VALUES (?1, ?2, 'pending', 0, ?3, ?3)
                 ON CONFLICT(change_request_id) DO UPDATE SET
                     status = CASE WHEN jobs.status IN ('completed', 'failed')
                                   THEN 'pending' ELSE jobs.status END,
                     error = CASE WHEN jobs.status IN ('completed', 'failed')
                                  THEN NULL ELSE jobs.error END,
                     updated_at = excluded.updated_at
                 RETURNING id",
                params![change_request_id.0, key, now],
                |row| row.get(0),
            )
            .map(JobId)
            .map_err(sql_err(OP))
        })
        .await
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        const OP: &str = "get_job";
        let row = self
            .run(OP, move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                    params![id.0],
                    JobRow::from_row,
                )
                .optional()
                .map_err(sql_err(OP))
            })
            .await?;
        row.map(JobRow::into_job).transpose()
    }

    async fn get_job_by_key(&self, job_key: &JobKey) -> Result<Option<Job>, StoreError> {
        const OP: &str = "get_job_by_key";
        let key = job_key.to_string();
        let row = self
            .run(OP, move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM jobs WHERE job_key = ?1", JOB_COLUMNS),
                    params![key],
                    JobRow::from_row,
                )
                .optional()
                .map_err(sql_err(OP))
            })
            .await?;
        row.map(JobRow::into_job).transpose()
    }

    async fn transition_job(&self, id: JobId, transition: &JobTransition) -> Result<(), StoreError> {
        const OP: &str = "transition_job";
        let status = transition.status.as_str();
        let attempts = i64::from(transition.attempts);
        let error = transition.error.clone();
        let completed_at = transition.completed_at.map(dt_to_ms);
        let now = dt_to_ms(Utc::now());

        let changed = self
            .run(OP, move |conn| {
                conn.execute(
                    "UPDATE jobs SET
                         status = ?2,
                         attempts = MAX(attempts, ?3),
                         error = ?4,
                         completed_at = COALESCE(completed_at, ?5),
                         updated_at = ?6
                     WHERE id = ?1",
                    params![id.0, status, attempts, error, completed_at, now],
                )
                .map_err(sql_err(OP))
            })
            .await?;

        if changed == 0 {
            return Err(StoreError::JobNotFound(id));
        }
        Ok(())
    }

    async fn save_review(
        &self,
        job_id: JobId,
        head_sha: &str,
        analysis: &Analysis,
    ) -> Result<(), StoreError> {
        const OP: &str = "save_review";
        let head_sha = head_sha.to_string();
        let summary = analysis.summary.clone();
        let issues_json = serde_json::to_string(&analysis.issues)
            .map_err(|e| StoreError::storage(OP, e.to_string()))?;
        let now = dt_to_ms(Utc::now());

        self.run(OP, move |conn| {
            conn.execute(
                "INSERT INTO reviews (job_id, head_sha, summary, issues_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![job_id.0, head_sha, summary, issues_json, now],
            )
            .map_err(sql_err(OP))?;
            Ok(())
        })
        .await
    }

    async fn latest_review(&self, job_id: JobId) -> Result<Option<StoredReview>, StoreError> {
        const OP: &str = "latest_review";
        let row: Option<(String, String, String, i64)> = self
            .run(OP, move |conn| {
                conn.query_row(
                    "SELECT head_sha, summary, issues_json, created_at FROM reviews
                     WHERE job_id = ?1 ORDER BY id DESC LIMIT 1",
                    params![job_id.0],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()
                .map_err(sql_err(OP))
            })
            .await?;

        let Some((head_sha, summary, issues_json, created_at)) = row else {
            return Ok(None);
        };
        let issues: Vec<Issue> = serde_json::from_str(&issues_json)
            .map_err(|_| StoreError::corruption("review issues JSON"))?;

        Ok(Some(StoredReview {
            job_id,
            head_sha,
            analysis: Analysis { summary, issues },
            created_at: ms_to_dt(created_at),
        }))
    }

    async fn job_counts(&self) -> Result<JobCounts, StoreError> {
        const OP: &str = "job_counts";
        let rows: Vec<(String, i64)> = self
            .run(OP, move |conn| {
                let mut stmt = conn
                    .prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                    .map_err(sql_err(OP))?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                    .map_err(sql_err(OP))?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(sql_err(OP))?;
                Ok(rows)
            })
            .await?;

        let mut counts = JobCounts::default();
        for (status, count) in rows {
            let count = u64::try_from(count).unwrap_or(0);
            match JobStatus::parse(&status) {
                Some(JobStatus::Pending) => counts.pending = count,
                Some(JobStatus::Processing) => counts.processing = count,
                Some(JobStatus::Completed) => counts.completed = count,
                Some(JobStatus::Failed) => counts.failed = count,
                None => return Err(StoreError::corruption(format!("job status '{}'", status))),
            }
        }
        Ok(counts)
    }

    async fn delete_repository(&self, external_id: u64) -> Result<bool, StoreError> {
        const OP: &str = "delete_repository";
        let external_id = to_i64(external_id, OP)?;
        let deleted = self
            .run(OP, move |conn| {
                conn.execute(
                    "DELETE FROM repositories WHERE external_id = ?1",
                    params![external_id],
                )
                .map_err(sql_err(OP))
            })
            .await?;
        Ok(deleted > 0)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        const OP: &str = "ping";
        self.run(OP, |conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(sql_err(OP))?;
            Ok(())
        })
        .await
    }
}
