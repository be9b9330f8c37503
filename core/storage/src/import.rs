//! Master-data import: parsing and full-category replace.

use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use fieldsync_common::{Category, Error, Result, SurveyRecord};

use crate::counters::CounterAggregator;
use crate::store::LocalStore;

/// Parse a JSON array of loosely-typed record objects.
///
/// One malformed element rejects the whole batch.
pub fn parse_batch(json: &str) -> Result<Vec<SurveyRecord>> {
    let value: Value =
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))?;
    let Value::Array(items) = value else {
        return Err(Error::Validation(
            "Import batch must be a JSON array".to_string(),
        ));
    };

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            SurveyRecord::from_value(item).map_err(|e| match e {
                Error::Validation(msg) => Error::Validation(format!("Element {}: {}", index, msg)),
                other => other,
            })
        })
        .collect()
}

/// Applies imported batches and keeps the counters in step.
pub struct BatchImporter {
    store: Arc<LocalStore>,
    counters: Arc<CounterAggregator>,
}

impl BatchImporter {
    pub fn new(store: Arc<LocalStore>, counters: Arc<CounterAggregator>) -> Self {
        Self { store, counters }
    }

    /// Replace every record of `category` with `records`, then recompute its counters.
    ///
    /// # Errors
    /// - `Validation` if any record is malformed; the existing rows are kept
    pub async fn insert_batch(&self, category: Category, records: &[SurveyRecord]) -> Result<usize> {
        let inserted = self.store.replace_category(category, records).await?;
        self.counters.recompute(category).await?;
        info!("Imported {} {} records", inserted, category);
        Ok(inserted)
    }
}
