//! Connectivity monitoring.
//!
//! `NetworkMonitor::report` is the single write path for connectivity.
//! Platform integrations or a polling probe call it; everything else only
//! reads the current state or subscribes to transitions.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use fieldsync_common::{ConnectivityState, Error, Result};

type Listener = Arc<dyn Fn(ConnectivityState) + Send + Sync>;

struct Listeners {
    next_id: u64,
    entries: BTreeMap<u64, Listener>,
}

/// Observes connectivity and notifies subscribers of transitions.
///
/// Every subscriber sees every transition, in order. Reporting a state equal
/// to the current one notifies nobody.
pub struct NetworkMonitor {
    state: Mutex<ConnectivityState>,
    listeners: Arc<Mutex<Listeners>>,
    /// Held while a transition is being delivered, so deliveries never interleave.
    delivery: Mutex<()>,
}

impl NetworkMonitor {
    pub fn new(initial: ConnectivityState) -> Self {
        Self {
            state: Mutex::new(initial),
            listeners: Arc::new(Mutex::new(Listeners {
                next_id: 0,
                entries: BTreeMap::new(),
            })),
            delivery: Mutex::new(()),
        }
    }

    /// Current connectivity.
    pub fn current_state(&self) -> ConnectivityState {
        *lock(&self.state)
    }

    /// Record a connectivity observation.
    ///
    /// Returns `true` if it was a transition and listeners were notified.
    /// Listeners run on the reporting thread and must not call `report`.
    pub fn report(&self, observed: ConnectivityState) -> bool {
        let _delivery = lock(&self.delivery);
        {
            let mut state = lock(&self.state);
            if *state == observed {
                return false;
            }
            info!(
                "Connectivity changed: connected={} reachable={}",
                observed.is_connected, observed.is_internet_reachable
            );
            *state = observed;
        }

        let listeners: Vec<Listener> = lock(&self.listeners).entries.values().cloned().collect();
        for listener in listeners {
            listener(observed);
        }
        true
    }

    /// Register a callback invoked on every transition.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(ConnectivityState) + Send + Sync + 'static,
    {
        let mut listeners = lock(&self.listeners);
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.entries.insert(id, Arc::new(listener));
        debug!("Connectivity subscriber {} registered", id);

        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Subscribe through an unbounded channel, for async consumers.
    pub fn subscribe_channel(&self) -> (Subscription, mpsc::UnboundedReceiver<ConnectivityState>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(move |state| {
            let _ = tx.send(state);
        });
        (subscription, rx)
    }

    /// Poll a probe on an interval and report what it observes.
    pub fn spawn_polling(
        self: &Arc<Self>,
        probe: Arc<dyn ConnectivityProbe>,
        period: Duration,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let observed = probe.probe().await;
                monitor.report(observed);
            }
        })
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(ConnectivityState::offline())
    }
}

/// Handle returned by `subscribe`. Call `unsubscribe` to stop notifications.
#[must_use = "dropping the handle leaves the listener registered with no way to remove it"]
pub struct Subscription {
    id: u64,
    listeners: Weak<Mutex<Listeners>>,
}

impl Subscription {
    /// Remove the listener. Has no effect if the monitor is gone.
    pub fn unsubscribe(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            lock(&listeners).entries.remove(&self.id);
            debug!("Connectivity subscriber {} removed", self.id);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Source of connectivity observations.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn probe(&self) -> ConnectivityState;
}

/// Probe that always reports the same state.
pub struct StaticProbe(pub ConnectivityState);

#[async_trait]
impl ConnectivityProbe for StaticProbe {
    async fn probe(&self) -> ConnectivityState {
        self.0
    }
}

/// Probe that issues a HEAD request against a known URL.
///
/// Any HTTP response means the internet is reachable. A connect failure
/// means the device is offline; other failures mean a link exists but the
/// backend cannot be reached.
pub struct HttpProbe {
    client: reqwest::Client,
    url: url::Url,
}

impl HttpProbe {
    pub fn new(url: url::Url, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("HTTP client: {}", e)))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn probe(&self) -> ConnectivityState {
        match self.client.head(self.url.clone()).send().await {
            Ok(_) => ConnectivityState::online(),
            Err(e) if e.is_connect() => ConnectivityState::offline(),
            Err(e) => {
                debug!("Connectivity probe failed: {}", e);
                ConnectivityState {
                    is_connected: true,
                    is_internet_reachable: false,
                }
            }
        }
    }
}
