//! Side-effect-free view of the sync queue.

use std::sync::Arc;

use fieldsync_common::{Category, Result, SurveyRecord};

use crate::store::LocalStore;

/// Answers "what is pending?" without mutating anything.
///
/// A record is pending when it is queued (`ToSync`) or was rolled back to
/// `Completed` by a failed submission. Both queries evaluate the same
/// predicate inside a single store transaction boundary, so the count always
/// agrees with the list taken at the same moment.
#[derive(Clone)]
pub struct SyncQueueSelector {
    store: Arc<LocalStore>,
}

impl SyncQueueSelector {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self { store }
    }

    /// Pending records, oldest edits first, optionally for one category.
    pub async fn pending_records(&self, category: Option<Category>) -> Result<Vec<SurveyRecord>> {
        self.store.pending(category).await
    }

    /// Number of pending records, for UI badges.
    pub async fn pending_count(&self, category: Option<Category>) -> Result<u64> {
        self.store.pending_count(category).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_common::{RecordId, RecordStatus};
    use serde_json::Map;

    async fn setup() -> (Arc<LocalStore>, SyncQueueSelector) {
        let store = Arc::new(LocalStore::in_memory());
        store.initialize().await.unwrap();
        (store.clone(), SyncQueueSelector::new(store))
    }

    async fn queue(store: &LocalStore, id: &str, category: Category) {
        let record = SurveyRecord::new(
            RecordId::new(id).unwrap(),
            category,
            RecordStatus::Completed,
            Map::new(),
        );
        store.upsert_record(&record).await.unwrap();
        store
            .update_status(&record.id, RecordStatus::ToSync)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pending_in_queue_order() {
        let (store, selector) = setup().await;
        queue(&store, "C-1", Category::ConsumerIndexing).await;
        queue(&store, "M-1", Category::MeterInstallation).await;
        queue(&store, "C-2", Category::ConsumerIndexing).await;

        let ids: Vec<String> = selector
            .pending_records(None)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id.to_string())
            .collect();
        assert_eq!(ids, vec!["C-1", "M-1", "C-2"]);
        assert_eq!(selector.pending_count(None).await.unwrap(), 3);

        let consumer = selector
            .pending_records(Some(Category::ConsumerIndexing))
            .await
            .unwrap();
        assert_eq!(consumer.len(), 2);
        assert_eq!(
            selector
                .pending_count(Some(Category::ConsumerIndexing))
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_completed_without_failure_is_not_pending() {
        let (store, selector) = setup().await;
        let record = SurveyRecord::new(
            RecordId::new("C-1").unwrap(),
            Category::ConsumerIndexing,
            RecordStatus::Completed,
            Map::new(),
        );
        store.upsert_record(&record).await.unwrap();

        assert!(selector.pending_records(None).await.unwrap().is_empty());
        assert_eq!(selector.pending_count(None).await.unwrap(), 0);
    }
}
