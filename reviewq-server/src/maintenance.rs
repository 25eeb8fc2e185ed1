//! Periodic queue housekeeping: reclaim expired leases and prune old entries.

use std::sync::Arc;

use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::queue::{JobQueue, QueueError};
use crate::state_machine::{JobEvent, JobTracker, TrackerError};

pub const LEASE_EXPIRED_ERROR: &str = "lease expired";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub requeued: usize,
    pub dead_lettered: usize,
    pub pruned: u64,
}

pub struct Maintenance {
    queue: Arc<dyn JobQueue>,
    tracker: JobTracker,
}

impl Maintenance {
    pub fn new(queue: Arc<dyn JobQueue>, tracker: JobTracker) -> Self {
        Self { queue, tracker }
    }

    pub async fn run(&self, every: Duration, cancel: CancellationToken) {
        let mut interval = interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            if let Err(e) = self.sweep().await {
                error!("Queue maintenance failed: {}", e);
            }
        }
    }

    /// One pass: reap expired leases, fail jobs whose last delivery expired,
    /// then prune.
    pub async fn sweep(&self) -> Result<SweepReport, QueueError> {
        let mut report = SweepReport::default();

        for entry in self.queue.reap_expired().await? {
            if !entry.dead_lettered {
                warn!(
                    job_key = %entry.job_key,
                    attempts = entry.attempts,
                    "Lease expired, entry requeued"
                );
                report.requeued += 1;
                continue;
            }

            report.dead_lettered += 1;
            error!(
                job_key = %entry.job_key,
                attempts = entry.attempts,
                "Lease expired on final attempt, entry dead-lettered"
            );
            let event = JobEvent::LeaseExpired {
                error: LEASE_EXPIRED_ERROR.to_string(),
            };
            match self.tracker.apply_by_key(&entry.job_key, event).await {
                Ok(_) => {}
                // Already settled by the worker or reopened by a new event.
                Err(TrackerError::Transition(_) | TrackerError::NotFound(_)) => {}
                Err(e) => error!(job_key = %entry.job_key, "Could not fail job: {}", e),
            }
        }

        report.pruned = self.queue.prune().await?;

        if report != SweepReport::default() {
            info!(
                requeued = report.requeued,
                dead_lettered = report.dead_lettered,
                pruned = report.pruned,
                "Queue maintenance pass"
            );
        }
        Ok(report)
    }
}
