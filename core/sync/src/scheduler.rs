//! Sync scheduling - manual, reconnect-triggered and periodic modes.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use fieldsync_common::{Category, ConnectivityState, Error, Result};

use crate::network::NetworkMonitor;
use crate::state::SyncOutcome;

/// Sync mode configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Manual sync only.
    Manual,
    /// Sync everything when connectivity comes back.
    OnReconnect,
    /// Sync at regular intervals.
    Periodic { interval: Duration },
    /// Both reconnect-triggered and periodic.
    Hybrid { interval: Duration },
}

impl SyncMode {
    fn period(&self) -> Option<Duration> {
        match self {
            SyncMode::Periodic { interval } | SyncMode::Hybrid { interval } => Some(*interval),
            _ => None,
        }
    }

    fn syncs_on_reconnect(&self) -> bool {
        matches!(self, SyncMode::OnReconnect | SyncMode::Hybrid { .. })
    }
}

/// Sync request types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRequest {
    /// Sync all pending records.
    All,
    /// Sync one category's pending records.
    Category(Category),
    /// Shutdown the scheduler.
    Shutdown,
}

type Reply = oneshot::Sender<Result<SyncOutcome>>;

/// Front end for requesting syncs from the scheduler task.
#[derive(Clone)]
pub struct SyncScheduler {
    /// Current sync mode.
    mode: Arc<RwLock<SyncMode>>,
    /// Channel to send sync requests.
    request_tx: mpsc::Sender<(SyncRequest, Reply)>,
}

impl SyncScheduler {
    /// Create a new scheduler with the given mode.
    ///
    /// When `network` is given, reconnect-triggered modes watch it for
    /// unreachable -> reachable transitions.
    pub fn new(mode: SyncMode, network: Option<Arc<NetworkMonitor>>) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(16);
        let mode = Arc::new(RwLock::new(mode));

        let scheduler = Self {
            mode: mode.clone(),
            request_tx,
        };

        let handle = SyncSchedulerHandle {
            mode,
            request_rx,
            network,
        };

        (scheduler, handle)
    }

    /// Request a sync of everything pending and wait for its outcome.
    pub async fn request_sync(&self) -> Result<SyncOutcome> {
        self.request(SyncRequest::All).await
    }

    /// Request a sync of one category and wait for its outcome.
    pub async fn request_category_sync(&self, category: Category) -> Result<SyncOutcome> {
        self.request(SyncRequest::Category(category)).await
    }

    async fn request(&self, request: SyncRequest) -> Result<SyncOutcome> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send((request, response_tx))
            .await
            .map_err(|_| Error::Config("Scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Config("Failed to receive sync result".to_string()))?
    }

    /// Change the sync mode.
    pub async fn set_mode(&self, mode: SyncMode) {
        *self.mode.write().await = mode;
    }

    /// Get current sync mode.
    pub async fn get_mode(&self) -> SyncMode {
        self.mode.read().await.clone()
    }

    /// Stop the scheduler task.
    pub async fn shutdown(&self) {
        let (response_tx, _) = oneshot::channel();
        let _ = self
            .request_tx
            .send((SyncRequest::Shutdown, response_tx))
            .await;
    }
}

/// Handle for the scheduler background task.
pub struct SyncSchedulerHandle {
    mode: Arc<RwLock<SyncMode>>,
    request_rx: mpsc::Receiver<(SyncRequest, Reply)>,
    network: Option<Arc<NetworkMonitor>>,
}

impl SyncSchedulerHandle {
    /// Run the scheduler background task.
    ///
    /// This should be spawned in a tokio task. `sync_fn` performs the sync;
    /// it is normally a call into `SyncOrchestrator`. Requests are handled one
    /// at a time, so automatic triggers never overlap a manual request issued
    /// through this scheduler.
    pub async fn run<F, Fut>(mut self, sync_fn: F)
    where
        F: Fn(SyncRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<SyncOutcome>> + Send,
    {
        let mut connectivity = self.network.as_ref().map(|n| {
            let last = n.current_state();
            let (subscription, rx) = n.subscribe_channel();
            (subscription, rx, last)
        });
        let mut current_period = self.mode.read().await.period();
        let mut ticker = current_period.map(periodic_interval);

        info!("Sync scheduler started");

        loop {
            tokio::select! {
                request = self.request_rx.recv() => {
                    let Some((request, response_tx)) = request else {
                        info!("All scheduler senders dropped");
                        break;
                    };
                    if request == SyncRequest::Shutdown {
                        info!("Received shutdown request");
                        break;
                    }
                    debug!("Processing sync request: {:?}", request);
                    let _ = response_tx.send(sync_fn(request).await);
                }

                Some(state) = next_transition(&mut connectivity) => {
                    if self.mode.read().await.syncs_on_reconnect() {
                        debug!("Connectivity restored, triggering sync");
                        log_automatic("Reconnect", sync_fn(SyncRequest::All).await);
                    }
                    debug!("Connectivity now {:?}", state);
                }

                _ = wait_for_periodic(&mut ticker) => {
                    debug!("Triggering periodic sync");
                    log_automatic("Periodic", sync_fn(SyncRequest::All).await);
                }
            }

            // Recreate interval if mode changed
            let period = self.mode.read().await.period();
            if period != current_period {
                current_period = period;
                ticker = period.map(periodic_interval);
            }
        }

        if let Some((subscription, _, _)) = connectivity {
            subscription.unsubscribe();
        }
        info!("Sync scheduler stopped");
    }
}

/// Wait for the next offline -> online transition. Pends forever without a monitor.
async fn next_transition(
    connectivity: &mut Option<(
        crate::network::Subscription,
        mpsc::UnboundedReceiver<ConnectivityState>,
        ConnectivityState,
    )>,
) -> Option<ConnectivityState> {
    let Some((_, rx, last)) = connectivity else {
        return std::future::pending().await;
    };
    loop {
        let state = rx.recv().await?;
        let reconnected = !last.can_submit() && state.can_submit();
        *last = state;
        if reconnected {
            return Some(state);
        }
    }
}

fn periodic_interval(period: Duration) -> Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.reset();
    ticker
}

async fn wait_for_periodic(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn log_automatic(trigger: &str, result: Result<SyncOutcome>) {
    match result {
        Ok(outcome) => info!(
            "{} sync completed: {} submitted, {} succeeded, {} failed",
            trigger, outcome.submitted, outcome.succeeded, outcome.failed
        ),
        Err(Error::AlreadyRunning) => debug!("{} sync skipped: a cycle is running", trigger),
        Err(e) if e.is_fatal() => error!("{} sync aborted: {}", trigger, e),
        Err(e) => warn!("{} sync failed: {}", trigger, e),
    }
}
