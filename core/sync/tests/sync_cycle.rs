//! End-to-end sync cycles against a real SQLite store.

use async_trait::async_trait;
use serde_json::{json, Map};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;

use fieldsync_common::{
    Category, ConnectivityState, CounterScope, Error, FailureReason, RecordFilter, RecordId,
    RecordStatus, Result, SurveyRecord,
};
use fieldsync_storage::{BatchImporter, CounterAggregator, LocalStore};
use fieldsync_sync::{
    NetworkMonitor, RetryConfig, RunState, SubmissionClient, SubmissionPayload,
    SubmissionResponse, SyncConfig, SyncOrchestrator,
};

/// Rejects a fixed set of ids and accepts everything else.
#[derive(Default)]
struct RecordingClient {
    reject: HashSet<String>,
    seen: Mutex<Vec<String>>,
}

impl RecordingClient {
    fn rejecting(ids: &[&str]) -> Self {
        Self {
            reject: ids.iter().map(|id| id.to_string()).collect(),
            seen: Mutex::new(Vec::new()),
        }
    }

    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl SubmissionClient for RecordingClient {
    fn name(&self) -> &str {
        "recording"
    }

    async fn submit(&self, payload: &SubmissionPayload) -> Result<SubmissionResponse> {
        let id = payload.record_id.to_string();
        self.seen.lock().unwrap().push(id.clone());
        if self.reject.contains(&id) {
            Ok(SubmissionResponse::rejected("invalid meter reading"))
        } else {
            Ok(SubmissionResponse::accepted())
        }
    }
}

/// Blocks its first submission until released.
struct GatedClient {
    started: Notify,
    release: Notify,
}

#[async_trait]
impl SubmissionClient for GatedClient {
    fn name(&self) -> &str {
        "gated"
    }

    async fn submit(&self, _payload: &SubmissionPayload) -> Result<SubmissionResponse> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(SubmissionResponse::accepted())
    }
}

/// Wipes the meter installation category while the given record is in flight,
/// the way a bulk re-import on the device would.
struct ReimportingClient {
    store: Arc<LocalStore>,
    trigger: String,
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl SubmissionClient for ReimportingClient {
    fn name(&self) -> &str {
        "reimporting"
    }

    async fn submit(&self, payload: &SubmissionPayload) -> Result<SubmissionResponse> {
        let id = payload.record_id.to_string();
        self.seen.lock().unwrap().push(id.clone());
        if id == self.trigger {
            self.store
                .replace_category(Category::MeterInstallation, &[])
                .await?;
        }
        Ok(SubmissionResponse::accepted())
    }
}

struct Harness {
    _dir: TempDir,
    store: Arc<LocalStore>,
    counters: Arc<CounterAggregator>,
    network: Arc<NetworkMonitor>,
}

impl Harness {
    async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::open(dir.path().join("fieldsync.db")));
        store.initialize().await.unwrap();
        Self {
            _dir: dir,
            counters: Arc::new(CounterAggregator::new(store.clone())),
            network: Arc::new(NetworkMonitor::new(ConnectivityState::online())),
            store,
        }
    }

    fn orchestrator<C: SubmissionClient + ?Sized + 'static>(
        &self,
        client: Arc<C>,
    ) -> SyncOrchestrator<C> {
        SyncOrchestrator::from_arc(
            self.store.clone(),
            self.counters.clone(),
            self.network.clone(),
            client,
            SyncConfig {
                submission_timeout: Duration::from_secs(5),
                retry: RetryConfig::new(0),
            },
        )
    }

    /// Create a completed record and queue it for sync.
    async fn queue(&self, category: Category, id: &str) -> RecordId {
        let mut payload = Map::new();
        payload.insert("reading".to_string(), json!(1042));
        let record = SurveyRecord::new(
            RecordId::new(id).unwrap(),
            category,
            RecordStatus::Completed,
            payload,
        );
        self.store.upsert_record(&record).await.unwrap();
        self.store
            .update_status(&record.id, RecordStatus::ToSync)
            .await
            .unwrap();
        record.id
    }

    async fn status(&self, id: &str) -> RecordStatus {
        self.store
            .get_record(&RecordId::new(id).unwrap())
            .await
            .unwrap()
            .unwrap()
            .status
    }

    async fn snapshot(&self) -> Vec<(String, RecordStatus, u32)> {
        self.store
            .query_records(RecordFilter::all())
            .await
            .unwrap()
            .into_iter()
            .map(|r| (r.id.to_string(), r.status, r.sync_attempts))
            .collect()
    }
}

#[tokio::test]
async fn all_submissions_succeed() {
    let harness = Harness::new().await;
    for id in ["C-1", "C-2", "C-3"] {
        harness.queue(Category::ConsumerIndexing, id).await;
    }
    harness.counters.recompute_all().await.unwrap();

    let orchestrator = harness.orchestrator(Arc::new(RecordingClient::default()));
    let outcome = orchestrator.run_sync().await.unwrap();

    assert_eq!(outcome.submitted, 3);
    assert_eq!(outcome.succeeded, 3);
    assert_eq!(outcome.failed, 0);
    for id in ["C-1", "C-2", "C-3"] {
        assert_eq!(harness.status(id).await, RecordStatus::Synced);
    }

    let counters = harness
        .counters
        .counters(CounterScope::Category(Category::ConsumerIndexing))
        .await
        .unwrap();
    assert_eq!(counters.to_sync, 0);
    assert_eq!(counters.synced, 3);
    assert_eq!(counters.total_completed, 3);
}

#[tokio::test]
async fn one_failure_does_not_stop_the_cycle() {
    let harness = Harness::new().await;
    for id in ["C-1", "C-2", "C-3"] {
        harness.queue(Category::ConsumerIndexing, id).await;
    }

    let client = Arc::new(RecordingClient::rejecting(&["C-2"]));
    let orchestrator = harness.orchestrator(client.clone());
    let outcome = orchestrator.run_sync().await.unwrap();

    assert_eq!(outcome.submitted, 3);
    assert_eq!(outcome.succeeded, 2);
    assert_eq!(outcome.failed, 1);
    assert_eq!(outcome.failures[0].record_id.as_str(), "C-2");
    assert_eq!(client.seen(), vec!["C-1", "C-2", "C-3"]);

    assert_eq!(harness.status("C-1").await, RecordStatus::Synced);
    assert_eq!(harness.status("C-2").await, RecordStatus::Completed);
    assert_eq!(harness.status("C-3").await, RecordStatus::Synced);

    let failed = harness
        .store
        .get_record(&RecordId::new("C-2").unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.sync_attempts, 1);
    assert!(failed.last_sync_error.unwrap().contains("invalid meter reading"));

    let counters = harness
        .counters
        .counters(CounterScope::Category(Category::ConsumerIndexing))
        .await
        .unwrap();
    assert_eq!(counters.synced, 2);
    assert_eq!(counters.completed, 1);
    assert_eq!(counters.to_sync, 0);
}

#[tokio::test]
async fn empty_queue_is_a_clean_noop() {
    let harness = Harness::new().await;
    let client = Arc::new(RecordingClient::default());
    let orchestrator = harness.orchestrator(client.clone());

    let outcome = orchestrator.run_sync().await.unwrap();
    assert_eq!((outcome.submitted, outcome.succeeded, outcome.failed), (0, 0, 0));
    assert!(client.seen().is_empty());
    assert_eq!(orchestrator.run_state(), RunState::Completed);

    let total = harness.counters.counters(CounterScope::Total).await.unwrap();
    assert!(total.is_zero());
}

#[tokio::test]
async fn bulk_import_updates_counters() {
    let harness = Harness::new().await;
    let records: Vec<SurveyRecord> = (1..=50)
        .map(|n| {
            SurveyRecord::new(
                RecordId::new(format!("C-{}", n)).unwrap(),
                Category::ConsumerIndexing,
                RecordStatus::Draft,
                Map::new(),
            )
        })
        .collect();

    let importer = BatchImporter::new(harness.store.clone(), harness.counters.clone());
    assert_eq!(
        importer
            .insert_batch(Category::ConsumerIndexing, &records)
            .await
            .unwrap(),
        50
    );

    let counters = harness
        .counters
        .counters(CounterScope::Category(Category::ConsumerIndexing))
        .await
        .unwrap();
    assert_eq!(counters.draft, 50);
    assert_eq!(counters.total, 50);
    assert_eq!(counters.assigned, 0);
    assert_eq!(counters.completed, 0);
    assert_eq!(counters.to_sync, 0);
    assert_eq!(counters.total_completed, 0);

    let total = harness.counters.counters(CounterScope::Total).await.unwrap();
    assert_eq!(total.draft, 50);
}

#[tokio::test]
async fn failed_records_are_retried_next_cycle() {
    let harness = Harness::new().await;
    harness.queue(Category::MeterInstallation, "M-1").await;

    harness.network.report(ConnectivityState::offline());
    let client = Arc::new(RecordingClient::default());
    let orchestrator = harness.orchestrator(client.clone());

    let outcome = orchestrator.run_sync().await.unwrap();
    assert_eq!(outcome.failed, 1);
    assert!(matches!(
        outcome.failures[0].reason,
        FailureReason::NetworkUnreachable(_)
    ));
    assert_eq!(harness.status("M-1").await, RecordStatus::Completed);
    assert!(client.seen().is_empty());

    harness.network.report(ConnectivityState::online());
    let outcome = orchestrator.run_sync().await.unwrap();
    assert_eq!(outcome.succeeded, 1);
    assert_eq!(harness.status("M-1").await, RecordStatus::Synced);

    let synced = harness
        .store
        .get_record(&RecordId::new("M-1").unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(synced.sync_attempts, 0);
    assert!(synced.synced_at.is_some());
}

#[tokio::test]
async fn second_run_while_running_is_rejected() {
    let harness = Harness::new().await;
    harness.queue(Category::ConsumerIndexing, "C-1").await;

    let client = Arc::new(GatedClient {
        started: Notify::new(),
        release: Notify::new(),
    });
    let orchestrator = Arc::new(harness.orchestrator(client.clone()));

    let running = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run_sync().await })
    };
    client.started.notified().await;
    assert_eq!(orchestrator.run_state(), RunState::Running);

    let before = harness.snapshot().await;
    let second = orchestrator
        .run_sync_category(Category::ConsumerIndexing)
        .await;
    assert!(matches!(second, Err(Error::AlreadyRunning)));
    assert_eq!(harness.snapshot().await, before);

    client.release.notify_one();
    let outcome = running.await.unwrap().unwrap();
    assert_eq!(outcome.succeeded, 1);
    assert_eq!(orchestrator.run_state(), RunState::Completed);
}

#[tokio::test]
async fn concurrent_runs_submit_each_record_once() {
    let harness = Harness::new().await;
    for id in ["C-1", "C-2"] {
        harness.queue(Category::ConsumerIndexing, id).await;
    }
    let client = Arc::new(RecordingClient::default());
    let orchestrator = harness.orchestrator(client.clone());

    let (a, b) = futures::join!(orchestrator.run_sync(), orchestrator.run_sync());
    let succeeded: usize = [a, b]
        .into_iter()
        .filter_map(|r| r.ok())
        .map(|o| o.succeeded)
        .sum();

    assert_eq!(succeeded, 2);
    assert_eq!(client.seen().len(), 2);
}

#[tokio::test]
async fn clear_all_resets_records_and_counters() {
    let harness = Harness::new().await;
    harness.queue(Category::ConsumerIndexing, "C-1").await;
    harness.queue(Category::MeterInstallation, "M-1").await;
    harness.counters.recompute_all().await.unwrap();

    harness.store.clear_all().await.unwrap();

    assert_eq!(harness.store.count_all().await.unwrap(), 0);
    for scope in CounterScope::all() {
        assert!(harness.counters.counters(scope).await.unwrap().is_zero());
    }
}

#[tokio::test]
async fn record_removed_mid_flight_does_not_abort_the_cycle() {
    let harness = Harness::new().await;
    harness.queue(Category::ConsumerIndexing, "C-1").await;
    harness.queue(Category::MeterInstallation, "M-2").await;
    harness.queue(Category::ConsumerIndexing, "C-3").await;
    harness.counters.recompute_all().await.unwrap();

    let client = Arc::new(ReimportingClient {
        store: harness.store.clone(),
        trigger: "M-2".to_string(),
        seen: Mutex::new(Vec::new()),
    });
    let orchestrator = harness.orchestrator(client.clone());
    let outcome = orchestrator.run_sync().await.unwrap();

    assert_eq!(*client.seen.lock().unwrap(), vec!["C-1", "M-2", "C-3"]);
    assert_eq!(outcome.submitted, 3);
    assert_eq!(outcome.succeeded, 2);
    assert_eq!(outcome.failed, 1);
    assert_eq!(outcome.failures[0].record_id.as_str(), "M-2");
    assert!(matches!(
        outcome.failures[0].reason,
        FailureReason::LocalConflict(_)
    ));
    assert_eq!(orchestrator.run_state(), RunState::Completed);

    assert_eq!(harness.status("C-1").await, RecordStatus::Synced);
    assert_eq!(harness.status("C-3").await, RecordStatus::Synced);

    let consumer = harness
        .counters
        .counters(CounterScope::Category(Category::ConsumerIndexing))
        .await
        .unwrap();
    assert_eq!(consumer.synced, 2);
    assert_eq!(consumer.to_sync, 0);
    let meter = harness
        .counters
        .counters(CounterScope::Category(Category::MeterInstallation))
        .await
        .unwrap();
    assert!(meter.is_zero());
}

#[tokio::test]
async fn queued_record_cannot_be_edited_during_sync() {
    let harness = Harness::new().await;
    harness.queue(Category::ConsumerIndexing, "C-1").await;

    let client = Arc::new(GatedClient {
        started: Notify::new(),
        release: Notify::new(),
    });
    let orchestrator = Arc::new(harness.orchestrator(client.clone()));
    let running = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run_sync().await })
    };
    client.started.notified().await;

    let edit = SurveyRecord::new(
        RecordId::new("C-1").unwrap(),
        Category::ConsumerIndexing,
        RecordStatus::Assigned,
        Map::new(),
    );
    let err = harness.store.upsert_record(&edit).await.unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));

    client.release.notify_one();
    let outcome = running.await.unwrap().unwrap();
    assert_eq!(outcome.succeeded, 1);
    assert_eq!(harness.status("C-1").await, RecordStatus::Synced);
}
