//! Dashboard counter recomputation.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use fieldsync_common::{Category, CounterScope, DashboardCounters, RecordFilter, Result};

use crate::store::LocalStore;

/// Keeps `DashboardCounters` a faithful reflection of the local store.
///
/// Counters are always rebuilt from a full scan and written by replacement.
/// This is the only write path for counters besides `clear_all` reseeding
/// zero rows.
pub struct CounterAggregator {
    store: Arc<LocalStore>,
    /// Serializes recomputes so an older tally never overwrites a newer one.
    write_lock: Mutex<()>,
}

impl CounterAggregator {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// Recompute one category's counters and the global total.
    ///
    /// Returns the new counters for `category`.
    pub async fn recompute(&self, category: Category) -> Result<DashboardCounters> {
        let _guard = self.write_lock.lock().await;

        let records = self
            .store
            .query_records(RecordFilter::category(category))
            .await?;
        let counters = DashboardCounters::tally(records.iter().map(|r| r.status));
        let total = self.tally_total().await?;

        self.store
            .replace_counters(&[
                (CounterScope::Category(category), counters),
                (CounterScope::Total, total),
            ])
            .await?;

        debug!(
            "Recomputed counters for {}: {} records, {} pending",
            category, counters.total, counters.to_sync
        );
        Ok(counters)
    }

    /// Recompute every category and the total in one write.
    pub async fn recompute_all(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let records = self.store.query_records(RecordFilter::all()).await?;
        let mut rows = Vec::with_capacity(Category::ALL.len() + 1);
        for category in Category::ALL {
            let counters = DashboardCounters::tally(
                records
                    .iter()
                    .filter(|r| r.category == category)
                    .map(|r| r.status),
            );
            rows.push((CounterScope::Category(category), counters));
        }
        rows.push((
            CounterScope::Total,
            DashboardCounters::tally(records.iter().map(|r| r.status)),
        ));

        self.store.replace_counters(&rows).await
    }

    /// Read the cached counters for a scope. May be stale until the next recompute.
    pub async fn counters(&self, scope: CounterScope) -> Result<DashboardCounters> {
        self.store.counters(scope).await
    }

    async fn tally_total(&self) -> Result<DashboardCounters> {
        let records = self.store.query_records(RecordFilter::all()).await?;
        Ok(DashboardCounters::tally(records.iter().map(|r| r.status)))
    }
}
