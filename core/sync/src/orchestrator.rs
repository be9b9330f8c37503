//! Sync orchestrator that drives one synchronization cycle at a time.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use fieldsync_common::{Category, Error, FailureReason, RecordStatus, Result, SurveyRecord};
use fieldsync_storage::{CounterAggregator, LocalStore, SyncQueueSelector};

use crate::network::NetworkMonitor;
use crate::retry::{RetryConfig, RetryExecutor};
use crate::state::{RunState, RunTracker, SyncOutcome};
use crate::submit::{SubmissionClient, SubmissionPayload};

/// Configuration for the sync orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Upper bound for one record's submission, retries included.
    pub submission_timeout: Duration,
    /// Retry policy for unreachable endpoints.
    pub retry: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            submission_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

/// Drives sync cycles: pending records are submitted one by one and each
/// outcome is written back to the local store.
///
/// At most one cycle runs at a time; a second call while a cycle is running
/// fails with `AlreadyRunning` and touches nothing. A running cycle always
/// finishes its fetched snapshot.
pub struct SyncOrchestrator<C: SubmissionClient + ?Sized> {
    /// Local store the outcomes are written to.
    store: Arc<LocalStore>,
    /// Pending-record view of the store.
    queue: SyncQueueSelector,
    /// Counter recompute after each cycle.
    counters: Arc<CounterAggregator>,
    /// Connectivity source.
    network: Arc<NetworkMonitor>,
    /// Remote submission collaborator.
    client: Arc<C>,
    /// Retry executor.
    retry_executor: RetryExecutor,
    /// Run state and single-run guard.
    tracker: RunTracker,
    /// Configuration.
    config: SyncConfig,
}

impl<C: SubmissionClient + 'static> SyncOrchestrator<C> {
    /// Create a new orchestrator.
    pub fn new(
        store: Arc<LocalStore>,
        counters: Arc<CounterAggregator>,
        network: Arc<NetworkMonitor>,
        client: C,
        config: SyncConfig,
    ) -> Self {
        Self::from_arc(store, counters, network, Arc::new(client), config)
    }
}

impl<C: SubmissionClient + ?Sized + 'static> SyncOrchestrator<C> {
    /// Create a new orchestrator from an Arc-wrapped client.
    pub fn from_arc(
        store: Arc<LocalStore>,
        counters: Arc<CounterAggregator>,
        network: Arc<NetworkMonitor>,
        client: Arc<C>,
        config: SyncConfig,
    ) -> Self {
        Self {
            queue: SyncQueueSelector::new(store.clone()),
            store,
            counters,
            network,
            client,
            retry_executor: RetryExecutor::new(config.retry.clone()),
            tracker: RunTracker::new(),
            config,
        }
    }

    /// Current run state.
    pub fn run_state(&self) -> RunState {
        self.tracker.state()
    }

    /// Get the pending-record selector.
    pub fn queue(&self) -> &SyncQueueSelector {
        &self.queue
    }

    /// Sync every pending record of every category.
    pub async fn run_sync(&self) -> Result<SyncOutcome> {
        self.run(None).await
    }

    /// Sync the pending records of one category, under the same guard.
    pub async fn run_sync_category(&self, category: Category) -> Result<SyncOutcome> {
        self.run(Some(category)).await
    }

    async fn run(&self, scope: Option<Category>) -> Result<SyncOutcome> {
        let guard = self.tracker.try_begin()?;
        let run_id = Uuid::new_v4();
        let start = Instant::now();
        let label = scope.map_or("all categories", |c| c.as_str());

        info!("Starting sync {} ({})", run_id, label);

        match self.run_cycle(scope).await {
            Ok(mut outcome) => {
                outcome.duration = start.elapsed();
                guard.complete();
                info!(
                    "Sync {} completed in {:?}: {} submitted, {} succeeded, {} failed",
                    run_id, outcome.duration, outcome.submitted, outcome.succeeded, outcome.failed
                );
                Ok(outcome)
            }
            Err(e) => {
                guard.abort();
                error!("Sync {} aborted: {}", run_id, e);
                Err(e)
            }
        }
    }

    /// Submit the fetched snapshot sequentially, then recompute counters.
    async fn run_cycle(&self, scope: Option<Category>) -> Result<SyncOutcome> {
        let pending = self.queue.pending_records(scope).await?;
        let mut outcome = SyncOutcome::empty(scope);
        if pending.is_empty() {
            debug!("Nothing pending");
            return Ok(outcome);
        }

        let mut affected = HashSet::new();
        let mut submitted = Ok(());
        for record in pending {
            affected.insert(record.category);
            submitted = self.sync_record(record, &mut outcome).await;
            if submitted.is_err() {
                break;
            }
        }

        // Counters must cover every outcome already written, aborted or not.
        let recomputed = self.recompute(&affected).await;
        if let (Err(_), Err(e)) = (&submitted, &recomputed) {
            warn!("Counter recompute after abort failed: {}", e);
        }
        submitted?;
        recomputed?;
        Ok(outcome)
    }

    /// Submit one record of the snapshot and write its outcome back.
    ///
    /// A record removed or moved out of the queue since the snapshot was
    /// taken is skipped before submission and tallied as a failure after it.
    /// Only store-level errors are returned.
    async fn sync_record(&self, record: SurveyRecord, outcome: &mut SyncOutcome) -> Result<()> {
        let category = record.category;

        // Records rolled back by an earlier failure re-enter the queue first.
        if record.status == RecordStatus::Completed {
            if let Err(e) = self.store.update_status(&record.id, RecordStatus::ToSync).await {
                return skip_conflict(&record, e);
            }
        }

        match self.submit_record(&record).await {
            Ok(()) => match self.store.update_status(&record.id, RecordStatus::Synced).await {
                Ok(_) => outcome.record_success(),
                Err(e) if is_local_conflict(&e) => {
                    warn!("{} was accepted but changed locally: {}", record.id, e);
                    outcome.record_failure(record.id, FailureReason::LocalConflict(e.to_string()));
                }
                Err(e) => return Err(e),
            },
            Err(reason) => {
                warn!("Submission of {} ({}) failed: {}", record.id, category, reason);
                match self
                    .store
                    .record_sync_failure(&record.id, &reason.to_string())
                    .await
                {
                    Ok(_) => {}
                    Err(e) if is_local_conflict(&e) => {
                        warn!("Could not roll back {}: {}", record.id, e);
                    }
                    Err(e) => return Err(e),
                }
                outcome.record_failure(record.id, reason);
            }
        }
        Ok(())
    }

    async fn recompute(&self, affected: &HashSet<Category>) -> Result<()> {
        for category in Category::ALL {
            if affected.contains(&category) {
                self.counters.recompute(category).await?;
            }
        }
        Ok(())
    }

    /// Submit one record. Every way it can fail collapses into a reason.
    async fn submit_record(&self, record: &SurveyRecord) -> std::result::Result<(), FailureReason> {
        let connectivity = self.network.current_state();
        if !connectivity.can_submit() {
            return Err(FailureReason::NetworkUnreachable(
                "device is offline".to_string(),
            ));
        }

        let payload = SubmissionPayload::from(record);
        let attempt = self.retry_executor.submit(&*self.client, &payload);

        match tokio::time::timeout(self.config.submission_timeout, attempt).await {
            Err(_) => Err(FailureReason::Timeout),
            Ok(Err(reason)) => Err(reason),
            Ok(Ok(response)) if response.success => {
                debug!("{} accepted by {}", record.id, self.client.name());
                Ok(())
            }
            Ok(Ok(response)) => Err(FailureReason::Rejected(response.message)),
        }
    }
}

/// The record was deleted or moved out of the queue by a local write.
fn is_local_conflict(err: &Error) -> bool {
    matches!(err, Error::NotFound(_) | Error::InvalidTransition { .. })
}

fn skip_conflict(record: &SurveyRecord, err: Error) -> Result<()> {
    if is_local_conflict(&err) {
        warn!("Skipping {}: it changed since the queue was read ({})", record.id, err);
        Ok(())
    } else {
        Err(err)
    }
}
