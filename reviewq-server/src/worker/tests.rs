//! Worker tests against the in-memory store, an in-memory SQLite queue and
//! scripted collaborators.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reviewq_core::{Analysis, ChangeMetadata, ChangedFile, FetchedChange, FileStatus};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::{Collaborators, ProcessOutcome, Worker, WorkerPool};
use crate::collaborators::{Analyzer, ChangeSource, RepoRef, ResultPublisher};
use crate::ids::JobKey;
use crate::ingest::{InboundEvent, Ingestor};
use crate::payload::tests::pull_request_body;
use crate::queue::{FailOutcome, JobQueue, QueueConfig, RetryPolicy, SqliteQueue};
use crate::signature::{compute_signature, format_signature_header};
use crate::state_machine::JobStatus;
use crate::store::{InMemoryRecordStore, RecordStore};

const SECRET: &[u8] = b"worker-secret";

/// Fails the first `failures` fetches, then succeeds.
struct ScriptedSource {
    failures: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl ChangeSource for ScriptedSource {
    async fn fetch_change(
        &self,
        _correlation_id: Option<&str>,
        repo: &RepoRef,
        number: u64,
    ) -> Result<FetchedChange> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(anyhow!("upstream returned 502"));
        }
        Ok(FetchedChange {
            metadata: ChangeMetadata {
                repo_full_name: repo.full_name(),
                number,
                title: "Add feature".to_string(),
                author: "octocat".to_string(),
                body: None,
                head_sha: "abc123def4567890".to_string(),
                base_sha: "0000000000000000".to_string(),
                head_ref: "feature".to_string(),
                base_ref: "main".to_string(),
                html_url: None,
            },
            changed_files: vec![ChangedFile {
                path: "src/lib.rs".to_string(),
                status: FileStatus::Modified,
                additions: 1,
                deletions: 0,
                patch: Some("@@ -1 +1 @@\n+fn x() {}".to_string()),
                previous_path: None,
            }],
        })
    }
}

#[derive(Default)]
struct FixedAnalyzer {
    calls: AtomicUsize,
}

#[async_trait]
impl Analyzer for FixedAnalyzer {
    async fn analyze(
        &self,
        _correlation_id: Option<&str>,
        _metadata: &ChangeMetadata,
        _files: &[ChangedFile],
    ) -> Result<Analysis> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Analysis {
            summary: "Looks fine.".to_string(),
            issues: vec![],
        })
    }
}

/// Rejects the next `failures` posts, then records them.
#[derive(Default)]
struct RecordingPublisher {
    failures: AtomicUsize,
    posted: Mutex<Vec<(String, u64, String)>>,
    correlation_ids: Mutex<Vec<Option<String>>>,
}

#[async_trait]
impl ResultPublisher for RecordingPublisher {
    async fn publish_result(
        &self,
        correlation_id: Option<&str>,
        repo: &RepoRef,
        number: u64,
        rendered: &str,
    ) -> Result<()> {
        let rejected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(anyhow!("comment endpoint returned 503"));
        }
        self.posted
            .lock()
            .unwrap()
            .push((repo.full_name(), number, rendered.to_string()));
        self.correlation_ids
            .lock()
            .unwrap()
            .push(correlation_id.map(str::to_string));
        Ok(())
    }
}

struct Harness {
    store: Arc<InMemoryRecordStore>,
    queue: Arc<SqliteQueue>,
    source: Arc<ScriptedSource>,
    analyzer: Arc<FixedAnalyzer>,
    publisher: Arc<RecordingPublisher>,
    worker: Arc<Worker>,
}

fn harness(fetch_failures: usize) -> Harness {
    let store = Arc::new(InMemoryRecordStore::new());
    let config = QueueConfig {
        poll_interval: Duration::from_millis(20),
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::ZERO,
        },
        ..QueueConfig::default()
    };
    let queue = Arc::new(SqliteQueue::new_in_memory(config).unwrap());
    let source = Arc::new(ScriptedSource {
        failures: fetch_failures,
        calls: AtomicUsize::new(0),
    });
    let analyzer = Arc::new(FixedAnalyzer::default());
    let publisher = Arc::new(RecordingPublisher::default());
    let collaborators = Collaborators {
        source: source.clone(),
        analyzer: analyzer.clone(),
        publisher: publisher.clone(),
    };
    let worker = Arc::new(Worker::new(
        queue.clone(),
        store.clone(),
        collaborators,
        "test-version",
    ));
    Harness {
        store,
        queue,
        source,
        analyzer,
        publisher,
        worker,
    }
}

async fn ingest_opened(h: &Harness, repo_id: u64, number: u64) {
    let body = pull_request_body("opened", repo_id, number).to_string();
    let signature = format_signature_header(&compute_signature(body.as_bytes(), SECRET));
    Ingestor::new(h.store.clone(), h.queue.clone(), SECRET)
        .ingest(InboundEvent {
            event_kind: Some("pull_request"),
            delivery_id: Some("delivery-abc"),
            signature: Some(&signature),
            body: body.as_bytes(),
        })
        .await
        .unwrap();
}

async fn process_next(h: &Harness) -> ProcessOutcome {
    let lease = h.queue.try_dequeue().await.unwrap().expect("expected a lease");
    h.worker.process(&lease).await
}

#[tokio::test]
async fn test_success_completes_job_and_acks() {
    let h = harness(0);
    ingest_opened(&h, 42, 7).await;

    assert_eq!(process_next(&h).await, ProcessOutcome::Completed);

    let job = h
        .store
        .get_job_by_key(&JobKey::new(42, 7))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 1);
    assert!(job.completed_at.is_some());
    assert!(job.error.is_none());

    let review = h.store.latest_review(job.id).await.unwrap().unwrap();
    assert_eq!(review.analysis.summary, "Looks fine.");
    assert_eq!(review.head_sha, "abc123def4567890");

    let posted = h.publisher.posted.lock().unwrap().clone();
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0].0, "octocat/hello-world");
    assert_eq!(posted[0].1, 7);
    assert!(posted[0].2.contains("Looks fine."));
    assert_eq!(
        h.publisher.correlation_ids.lock().unwrap()[0].as_deref(),
        Some("delivery-abc")
    );

    let stats = h.queue.stats().await.unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.waiting + stats.active + stats.delayed, 0);
}

#[tokio::test]
async fn test_fail_fail_succeed() {
    let h = harness(2);
    ingest_opened(&h, 42, 7).await;
    let key = JobKey::new(42, 7);

    for attempt in 1..=2 {
        match process_next(&h).await {
            ProcessOutcome::Failed(FailOutcome::Retrying { attempt: a, .. }) => {
                assert_eq!(a, attempt)
            }
            other => panic!("expected a retry, got {:?}", other),
        }
        let job = h.store.get_job_by_key(&key).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, attempt);
        assert!(job.error.unwrap().contains("upstream returned 502"));
    }

    assert_eq!(process_next(&h).await, ProcessOutcome::Completed);

    let job = h.store.get_job_by_key(&key).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 3);
    assert!(job.completed_at.is_some());
    assert!(job.error.is_none());
    assert_eq!(h.publisher.posted.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_publish_retry_reuses_saved_analysis() {
    let h = harness(0);
    h.publisher.failures.store(1, Ordering::SeqCst);
    ingest_opened(&h, 42, 7).await;

    match process_next(&h).await {
        ProcessOutcome::Failed(FailOutcome::Retrying { attempt: 1, .. }) => {}
        other => panic!("expected a retry, got {:?}", other),
    }
    assert_eq!(process_next(&h).await, ProcessOutcome::Completed);

    assert_eq!(h.source.calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.analyzer.calls.load(Ordering::SeqCst), 1);
    let posted = h.publisher.posted.lock().unwrap().clone();
    assert_eq!(posted.len(), 1);
    assert!(posted[0].2.contains("Looks fine."));
}

#[tokio::test]
async fn test_new_cycle_analyzes_again() {
    let h = harness(0);
    ingest_opened(&h, 42, 7).await;
    assert_eq!(process_next(&h).await, ProcessOutcome::Completed);

    // Same head, but a fresh queue entry: the first delivery always analyzes.
    ingest_opened(&h, 42, 7).await;
    assert_eq!(process_next(&h).await, ProcessOutcome::Completed);

    assert_eq!(h.analyzer.calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.publisher.posted.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_exhausted_retries_dead_letter() {
    let h = harness(usize::MAX);
    ingest_opened(&h, 42, 7).await;

    let mut outcomes = Vec::new();
    while let Some(lease) = h.queue.try_dequeue().await.unwrap() {
        outcomes.push(h.worker.process(&lease).await);
        assert!(outcomes.len() <= 4, "entry kept being redelivered");
    }

    assert_eq!(outcomes.len(), 3);
    assert_eq!(
        outcomes[2],
        ProcessOutcome::Failed(FailOutcome::DeadLettered { attempts: 3 })
    );
    assert_eq!(h.source.calls.load(Ordering::SeqCst), 3);

    let job = h
        .store
        .get_job_by_key(&JobKey::new(42, 7))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 3);
    assert!(job.completed_at.is_none());

    assert_eq!(h.queue.stats().await.unwrap().failed, 1);
    assert!(h.queue.try_dequeue().await.unwrap().is_none());
    assert!(h.publisher.posted.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_entry_without_job_is_skipped() {
    let h = harness(0);
    ingest_opened(&h, 42, 7).await;
    assert!(h.store.delete_repository(42).await.unwrap());

    assert_eq!(process_next(&h).await, ProcessOutcome::Skipped);
    assert_eq!(h.source.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.queue.stats().await.unwrap().completed, 1);
}

#[tokio::test]
async fn test_undecodable_payload_fails_lease() {
    let h = harness(0);
    h.queue
        .enqueue(&JobKey::new(1, 1), &json!({"unexpected": true}))
        .await
        .unwrap();

    match process_next(&h).await {
        ProcessOutcome::Failed(FailOutcome::Retrying { attempt: 1, .. }) => {}
        other => panic!("expected a retry, got {:?}", other),
    }
    assert_eq!(h.source.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_store_outage_fails_lease_only() {
    let h = harness(0);
    ingest_opened(&h, 42, 7).await;
    h.store.set_available(false);

    match process_next(&h).await {
        ProcessOutcome::Failed(FailOutcome::Retrying { .. }) => {}
        other => panic!("expected a retry, got {:?}", other),
    }

    h.store.set_available(true);
    assert_eq!(process_next(&h).await, ProcessOutcome::Completed);
}

#[tokio::test]
async fn test_pool_drains_queue_and_stops_on_cancel() {
    let h = harness(0);
    ingest_opened(&h, 42, 1).await;
    ingest_opened(&h, 42, 2).await;
    ingest_opened(&h, 43, 1).await;

    let cancel = CancellationToken::new();
    let pool = WorkerPool::spawn(h.worker.clone(), 2, cancel.clone());
    assert_eq!(pool.len(), 2);

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if h.store.job_counts().await.unwrap().completed == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("workers did not finish in time");

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), pool.join())
        .await
        .expect("workers did not stop");

    assert_eq!(h.publisher.posted.lock().unwrap().len(), 3);
    assert_eq!(h.queue.stats().await.unwrap().completed, 3);
}
