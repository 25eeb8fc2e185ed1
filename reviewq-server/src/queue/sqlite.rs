//! SQLite implementation of `JobQueue`.
//!
//! The inherent `*_at` methods take the current time explicitly so tests can
//! drive leases and backoff without sleeping. The trait methods pass
//! `Utc::now()`.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    EnqueueOutcome, FailOutcome, JobQueue, Lease, QueueConfig, QueueError, QueueStats,
    ReapedEntry, RetryPolicy,
};
use crate::db::{dt_to_ms, ms_to_dt, open_database, Migration};
use crate::ids::JobKey;

const MIGRATIONS: &[Migration] = &[
    (
        1,
        r#"
    CREATE TABLE queue_entries (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_key TEXT NOT NULL,
        payload TEXT NOT NULL,
        state TEXT NOT NULL
            CHECK (state IN ('waiting', 'active', 'retrying', 'completed', 'failed')),
        attempts INTEGER NOT NULL DEFAULT 0,
        available_at INTEGER NOT NULL,
        lease_token TEXT,
        lease_expires_at INTEGER,
        last_error TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        finished_at INTEGER
    );
    CREATE UNIQUE INDEX idx_queue_live_key ON queue_entries(job_key)
        WHERE state IN ('waiting', 'active', 'retrying');
    CREATE INDEX idx_queue_ready ON queue_entries(state, available_at, id);
    CREATE INDEX idx_queue_lease ON queue_entries(state, lease_expires_at);
    CREATE INDEX idx_queue_finished ON queue_entries(state, finished_at);
    "#,
    ),
    // Set when new work arrives for an entry that is being processed.
    (
        2,
        "ALTER TABLE queue_entries ADD COLUMN requeue INTEGER NOT NULL DEFAULT 0",
    ),
];

/// Queue backed by its own SQLite file, separate from the record store.
pub struct SqliteQueue {
    pub(crate) conn: Arc<Mutex<Connection>>,
    config: QueueConfig,
    notify: Arc<Notify>,
}

fn sql_err(operation: &'static str) -> impl Fn(rusqlite::Error) -> QueueError {
    move |e| QueueError::storage(operation, e.to_string())
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn parse_key(raw: &str) -> Result<JobKey, QueueError> {
    raw.parse()
        .map_err(|_| QueueError::Corruption(format!("job key '{}'", raw)))
}

fn to_attempts(raw: i64) -> Result<u32, QueueError> {
    u32::try_from(raw).map_err(|_| QueueError::Corruption(format!("attempt count {}", raw)))
}

/// Put an active entry that received new work back to waiting with a fresh
/// delivery budget.
fn requeue_fresh(tx: &Transaction<'_>, entry_id: i64, now_ms: i64) -> Result<(), QueueError> {
    tx.execute(
        "UPDATE queue_entries SET state = 'waiting', attempts = 0, requeue = 0,
             lease_token = NULL, lease_expires_at = NULL, last_error = NULL,
             available_at = ?2, updated_at = ?2
         WHERE id = ?1",
        params![entry_id, now_ms],
    )
    .map_err(sql_err("requeue"))?;
    Ok(())
}

/// Requeue with backoff or dead-letter one active entry. Shared by explicit
/// failure and lease expiry.
fn settle_failure(
    tx: &Transaction<'_>,
    retry: &RetryPolicy,
    entry_id: i64,
    attempts: u32,
    reason: &str,
    now_ms: i64,
) -> Result<FailOutcome, QueueError> {
    const OP: &str = "fail";
    if attempts >= retry.max_attempts {
        tx.execute(
            "UPDATE queue_entries SET state = 'failed', lease_token = NULL,
                 lease_expires_at = NULL, last_error = ?2, finished_at = ?3, updated_at = ?3
             WHERE id = ?1",
            params![entry_id, reason, now_ms],
        )
        .map_err(sql_err(OP))?;
        return Ok(FailOutcome::DeadLettered { attempts });
    }

    let retry_at_ms = now_ms.saturating_add(duration_ms(retry.backoff(attempts)));
    tx.execute(
        "UPDATE queue_entries SET state = 'retrying', lease_token = NULL,
             lease_expires_at = NULL, last_error = ?2, available_at = ?3, updated_at = ?4
         WHERE id = ?1",
        params![entry_id, reason, retry_at_ms, now_ms],
    )
    .map_err(sql_err(OP))?;
    Ok(FailOutcome::Retrying {
        attempt: attempts,
        retry_at: ms_to_dt(retry_at_ms),
    })
}

impl SqliteQueue {
    pub fn new<P: AsRef<Path>>(path: P, config: QueueConfig) -> Result<Self, QueueError> {
        let conn = open_database(path, MIGRATIONS)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config,
            notify: Arc::new(Notify::new()),
        })
    }

    pub fn new_in_memory(config: QueueConfig) -> Result<Self, QueueError> {
        Self::new(":memory:", config)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    async fn run<T, F>(&self, operation: &'static str, f: F) -> Result<T, QueueError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, QueueError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| QueueError::storage(operation, "connection mutex poisoned"))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| QueueError::storage(operation, format!("task join error: {}", e)))?
    }

    pub async fn enqueue_at(
        &self,
        job_key: &JobKey,
        payload: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, QueueError> {
        const OP: &str = "enqueue";
        let key = job_key.to_string();
        let payload = serde_json::to_string(payload).map_err(|e| QueueError::storage(OP, e.to_string()))?;
        let now_ms = dt_to_ms(now);

        let outcome = self
            .run(OP, move |conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(sql_err(OP))?;

                let live: Option<(i64, String)> = tx
                    .query_row(
                        "SELECT id, state FROM queue_entries
                         WHERE job_key = ?1 AND state IN ('waiting', 'active', 'retrying')",
                        params![key],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()
                    .map_err(sql_err(OP))?;

                let outcome = match live {
                    None => {
                        tx.execute(
                            "INSERT INTO queue_entries
                                 (job_key, payload, state, attempts, available_at, created_at, updated_at)
                             VALUES (?1, ?2, 'waiting', 0, ?3, ?3, ?3)",
                            params![key, payload, now_ms],
                        )
                        .map_err(sql_err(OP))?;
                        EnqueueOutcome::Enqueued
                    }
                    Some((id, state)) if state == "active" => {
                        tx.execute(
                            "UPDATE queue_entries SET payload = ?2, requeue = 1, updated_at = ?3
                             WHERE id = ?1",
                            params![id, payload, now_ms],
                        )
                        .map_err(sql_err(OP))?;
                        EnqueueOutcome::Requeued
                    }
                    Some((id, _)) => {
                        tx.execute(
                            "UPDATE queue_entries SET payload = ?2, updated_at = ?3 WHERE id = ?1",
                            params![id, payload, now_ms],
                        )
                        .map_err(sql_err(OP))?;
                        EnqueueOutcome::Merged
                    }
                };

                tx.commit().map_err(sql_err(OP))?;
                Ok(outcome)
            })
            .await?;

        if outcome == EnqueueOutcome::Enqueued {
            self.notify.notify_one();
        }
        debug!("Enqueue {}: {:?}", job_key, outcome);
        Ok(outcome)
    }

    pub async fn try_dequeue_at(&self, now: DateTime<Utc>) -> Result<Option<Lease>, QueueError> {
        const OP: &str = "dequeue";
        let now_ms = dt_to_ms(now);
        let expires_ms = now_ms.saturating_add(duration_ms(self.config.lease_duration));
        let token = Uuid::new_v4().to_string();

        let claimed = self
            .run(OP, move |conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(sql_err(OP))?;

                let next: Option<(i64, String, String, i64)> = tx
                    .query_row(
                        "SELECT id, job_key, payload, attempts FROM queue_entries
                         WHERE state IN ('waiting', 'retrying') AND available_at <= ?1
                         ORDER BY available_at, id
                         LIMIT 1",
                        params![now_ms],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                    )
                    .optional()
                    .map_err(sql_err(OP))?;

                let Some((id, key, payload, attempts)) = next else {
                    return Ok(None);
                };

                tx.execute(
                    "UPDATE queue_entries SET state = 'active', attempts = attempts + 1,
                         lease_token = ?2, lease_expires_at = ?3, updated_at = ?4
                     WHERE id = ?1",
                    params![id, token, expires_ms, now_ms],
                )
                .map_err(sql_err(OP))?;
                tx.commit().map_err(sql_err(OP))?;

                Ok(Some((id, key, payload, attempts + 1, token)))
            })
            .await?;

        let Some((entry_id, key, payload, attempt, token)) = claimed else {
            return Ok(None);
        };

        let payload = serde_json::from_str(&payload)
            .map_err(|_| QueueError::Corruption(format!("payload of entry {}", entry_id)))?;

        Ok(Some(Lease {
            entry_id,
            job_key: parse_key(&key)?,
            payload,
            attempt: to_attempts(attempt)?,
            token,
            expires_at: ms_to_dt(expires_ms),
        }))
    }

    pub async fn ack_at(&self, lease: &Lease, now: DateTime<Utc>) -> Result<(), QueueError> {
        const OP: &str = "ack";
        let entry_id = lease.entry_id;
        let token = lease.token.clone();
        let now_ms = dt_to_ms(now);

        let settled = self
            .run(OP, move |conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(sql_err(OP))?;

                let requeue: Option<bool> = tx
                    .query_row(
                        "SELECT requeue FROM queue_entries
                         WHERE id = ?1 AND state = 'active' AND lease_token = ?2",
                        params![entry_id, token],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(sql_err(OP))?;

                let Some(requeue) = requeue else {
                    return Ok(None);
                };

                if requeue {
                    requeue_fresh(&tx, entry_id, now_ms)?;
                } else {
                    tx.execute(
                        "UPDATE queue_entries SET state = 'completed', lease_token = NULL,
                             lease_expires_at = NULL, finished_at = ?2, updated_at = ?2
                         WHERE id = ?1",
                        params![entry_id, now_ms],
                    )
                    .map_err(sql_err(OP))?;
                }
                tx.commit().map_err(sql_err(OP))?;
                Ok(Some(requeue))
            })
            .await?;

        match settled {
            None => Err(QueueError::LeaseLost {
                job_key: lease.job_key.clone(),
            }),
            Some(requeued) => {
                if requeued {
                    debug!("Entry {} received new work while active; requeued", lease.job_key);
                    self.notify.notify_one();
                }
                Ok(())
            }
        }
    }

    pub async fn fail_at(
        &self,
        lease: &Lease,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, QueueError> {
        const OP: &str = "fail";
        let entry_id = lease.entry_id;
        let token = lease.token.clone();
        let reason = reason.to_string();
        let retry = self.config.retry;
        let now_ms = dt_to_ms(now);

        let outcome = self
            .run(OP, move |conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(sql_err(OP))?;

                let current: Option<(i64, bool)> = tx
                    .query_row(
                        "SELECT attempts, requeue FROM queue_entries
                         WHERE id = ?1 AND state = 'active' AND lease_token = ?2",
                        params![entry_id, token],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()
                    .map_err(sql_err(OP))?;

                let Some((attempts, requeue)) = current else {
                    return Ok(None);
                };

                let outcome = if requeue {
                    requeue_fresh(&tx, entry_id, now_ms)?;
                    FailOutcome::Requeued
                } else {
                    settle_failure(&tx, &retry, entry_id, to_attempts(attempts)?, &reason, now_ms)?
                };
                tx.commit().map_err(sql_err(OP))?;
                Ok(Some(outcome))
            })
            .await?;

        let outcome = outcome.ok_or_else(|| QueueError::LeaseLost {
            job_key: lease.job_key.clone(),
        })?;

        match outcome {
            FailOutcome::Retrying { retry_at, .. } if retry_at <= now => self.notify.notify_one(),
            FailOutcome::Requeued => self.notify.notify_one(),
            _ => {}
        }
        Ok(outcome)
    }

    pub async fn reap_expired_at(&self, now: DateTime<Utc>) -> Result<Vec<ReapedEntry>, QueueError> {
        const OP: &str = "reap_expired";
        let retry = self.config.retry;
        let now_ms = dt_to_ms(now);

        let reaped = self
            .run(OP, move |conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(sql_err(OP))?;

                let expired: Vec<(i64, String, i64, bool)> = {
                    let mut stmt = tx
                        .prepare(
                            "SELECT id, job_key, attempts, requeue FROM queue_entries
                             WHERE state = 'active' AND lease_expires_at <= ?1",
                        )
                        .map_err(sql_err(OP))?;
                    let rows = stmt
                        .query_map(params![now_ms], |row| {
                            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                        })
                        .map_err(sql_err(OP))?
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(sql_err(OP))?;
                    rows
                };

                let mut reaped = Vec::with_capacity(expired.len());
                for (id, key, attempts, requeue) in expired {
                    let attempts = to_attempts(attempts)?;
                    let outcome = if requeue {
                        requeue_fresh(&tx, id, now_ms)?;
                        FailOutcome::Requeued
                    } else {
                        settle_failure(&tx, &retry, id, attempts, "lease expired", now_ms)?
                    };
                    reaped.push(ReapedEntry {
                        job_key: parse_key(&key)?,
                        attempts,
                        dead_lettered: matches!(outcome, FailOutcome::DeadLettered { .. }),
                    });
                }

                tx.commit().map_err(sql_err(OP))?;
                Ok(reaped)
            })
            .await?;

        for entry in &reaped {
            if entry.dead_lettered {
                warn!(
                    "Lease on {} expired after {} attempt(s); dead-lettered",
                    entry.job_key, entry.attempts
                );
            } else {
                info!(
                    "Lease on {} expired (attempt {}); requeued",
                    entry.job_key, entry.attempts
                );
            }
        }
        Ok(reaped)
    }

    pub async fn prune_at(&self, now: DateTime<Utc>) -> Result<u64, QueueError> {
        const OP: &str = "prune";
        let now_ms = dt_to_ms(now);
        let completed_before = now_ms.saturating_sub(duration_ms(self.config.completed_retention));
        let failed_before = now_ms.saturating_sub(duration_ms(self.config.failed_retention));

        let removed = self
            .run(OP, move |conn| {
                let completed = conn
                    .execute(
                        "DELETE FROM queue_entries WHERE state = 'completed' AND finished_at <= ?1",
                        params![completed_before],
                    )
                    .map_err(sql_err(OP))?;
                let failed = conn
                    .execute(
                        "DELETE FROM queue_entries WHERE state = 'failed' AND finished_at <= ?1",
                        params![failed_before],
                    )
                    .map_err(sql_err(OP))?;
                Ok((completed + failed) as u64)
            })
            .await?;

        if removed > 0 {
            debug!("Pruned {} finished queue entries", removed);
        }
        Ok(removed)
    }

    pub async fn stats_at(&self, now: DateTime<Utc>) -> Result<QueueStats, QueueError> {
        const OP: &str = "stats";
        let now_ms = dt_to_ms(now);

        let rows: Vec<(String, i64)> = self
            .run(OP, move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT CASE
                                    WHEN state = 'retrying' AND available_at > ?1 THEN 'delayed'
                                    WHEN state = 'retrying' THEN 'waiting'
                                    ELSE state
                                END AS bucket,
                                COUNT(*)
                         FROM queue_entries
                         GROUP BY bucket",
                    )
                    .map_err(sql_err(OP))?;
                let rows = stmt
                    .query_map(params![now_ms], |row| Ok((row.get(0)?, row.get(1)?)))
                    .map_err(sql_err(OP))?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(sql_err(OP))?;
                Ok(rows)
            })
            .await?;

        let mut stats = QueueStats::default();
        for (bucket, count) in rows {
            let count = u64::try_from(count).unwrap_or(0);
            match bucket.as_str() {
                "waiting" => stats.waiting = count,
                "delayed" => stats.delayed = count,
                "active" => stats.active = count,
                "completed" => stats.completed = count,
                "failed" => stats.failed = count,
                other => return Err(QueueError::Corruption(format!("entry state '{}'", other))),
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl JobQueue for SqliteQueue {
    async fn enqueue(
        &self,
        job_key: &JobKey,
        payload: &serde_json::Value,
    ) -> Result<EnqueueOutcome, QueueError> {
        self.enqueue_at(job_key, payload, Utc::now()).await
    }

    async fn try_dequeue(&self) -> Result<Option<Lease>, QueueError> {
        self.try_dequeue_at(Utc::now()).await
    }

    async fn ack(&self, lease: &Lease) -> Result<(), QueueError> {
        self.ack_at(lease, Utc::now()).await
    }

    async fn fail(&self, lease: &Lease, reason: &str) -> Result<FailOutcome, QueueError> {
        self.fail_at(lease, reason, Utc::now()).await
    }

    async fn reap_expired(&self) -> Result<Vec<ReapedEntry>, QueueError> {
        self.reap_expired_at(Utc::now()).await
    }

    async fn prune(&self) -> Result<u64, QueueError> {
        self.prune_at(Utc::now()).await
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.stats_at(Utc::now()).await
    }

    async fn ping(&self) -> Result<(), QueueError> {
        const OP: &str = "ping";
        self.run(OP, |conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(sql_err(OP))?;
            Ok(())
        })
        .await
    }

    async fn wait_for_work(&self) {
        let _ = tokio::time::timeout(self.config.poll_interval, self.notify.notified()).await;
    }
}
