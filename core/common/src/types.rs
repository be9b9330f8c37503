//! Common types used throughout FieldSync.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Stable external identifier of a consumer or installation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Create a new RecordId from a string.
    ///
    /// # Preconditions
    /// - `id` must be non-empty after trimming whitespace
    ///
    /// # Errors
    /// - Returns `Validation` if id is empty
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(crate::Error::Validation(
                "Record id cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

/// Survey category. Each category is stored in its own table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Consumer identity and location surveys.
    ConsumerIndexing,
    /// Meter installation or replacement surveys.
    MeterInstallation,
}

impl Category {
    /// All categories, in a stable order.
    pub const ALL: [Category; 2] = [Category::ConsumerIndexing, Category::MeterInstallation];

    /// Canonical string form, also used as the counter row key.
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::ConsumerIndexing => "consumer_indexing",
            Category::MeterInstallation => "meter_installation",
        }
    }

    /// Name of the table holding this category's records.
    pub fn table_name(&self) -> &'static str {
        match self {
            Category::ConsumerIndexing => "consumer_indexing_records",
            Category::MeterInstallation => "meter_installation_records",
        }
    }

    /// URL path segment used by the remote submission endpoint.
    pub fn endpoint_path(&self) -> &'static str {
        match self {
            Category::ConsumerIndexing => "consumer-indexing",
            Category::MeterInstallation => "meter-installation",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Category {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "consumer_indexing" | "consumer" | "indexing" => Ok(Category::ConsumerIndexing),
            "meter_installation" | "meter" | "installation" => Ok(Category::MeterInstallation),
            other => Err(crate::Error::Validation(format!(
                "Unknown category: {}",
                other
            ))),
        }
    }
}

/// Lifecycle status of a survey record.
///
/// ```text
/// Assigned ─┐
///           ├─> Completed ──> ToSync ──> Synced
/// Draft ────┘       ^           │
///                   └───────────┘ (rollback on failed submission)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Assigned,
    Draft,
    Completed,
    ToSync,
    Synced,
}

impl RecordStatus {
    pub const ALL: [RecordStatus; 5] = [
        RecordStatus::Assigned,
        RecordStatus::Draft,
        RecordStatus::Completed,
        RecordStatus::ToSync,
        RecordStatus::Synced,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Assigned => "assigned",
            RecordStatus::Draft => "draft",
            RecordStatus::Completed => "completed",
            RecordStatus::ToSync => "to_sync",
            RecordStatus::Synced => "synced",
        }
    }

    /// Whether a record may be created in this status by a local save.
    pub fn is_initial(&self) -> bool {
        matches!(
            self,
            RecordStatus::Assigned | RecordStatus::Draft | RecordStatus::Completed
        )
    }

    /// Whether the record has been locally completed at some point.
    pub fn counts_as_completed(&self) -> bool {
        matches!(
            self,
            RecordStatus::Completed | RecordStatus::ToSync | RecordStatus::Synced
        )
    }

    /// Check a single-step status change against the lifecycle.
    pub fn can_transition_to(&self, next: RecordStatus) -> bool {
        use RecordStatus::*;
        matches!(
            (self, next),
            (Assigned, Completed)
                | (Draft, Completed)
                | (Completed, ToSync)
                | (ToSync, Synced)
                | (ToSync, Completed)
        )
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "assigned" => Ok(RecordStatus::Assigned),
            "draft" => Ok(RecordStatus::Draft),
            "completed" => Ok(RecordStatus::Completed),
            "to_sync" | "tosync" => Ok(RecordStatus::ToSync),
            "synced" => Ok(RecordStatus::Synced),
            other => Err(crate::Error::Validation(format!("Unknown status: {}", other))),
        }
    }
}

/// A consumer-indexing or meter-installation survey entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurveyRecord {
    pub id: RecordId,
    pub category: Category,
    pub status: RecordStatus,
    /// Survey attributes (name, address, load, meter metadata, location...).
    /// Opaque to the engine beyond being serializable.
    pub payload: Map<String, Value>,
    /// Time of the last local mutation.
    pub modified_at: DateTime<Utc>,
    /// Failed submissions since the last success or local edit.
    pub sync_attempts: u32,
    /// Reason recorded by the last failed submission.
    pub last_sync_error: Option<String>,
    /// Time of the last acknowledged submission.
    pub synced_at: Option<DateTime<Utc>>,
}

impl SurveyRecord {
    /// Create a record with fresh bookkeeping.
    pub fn new(
        id: RecordId,
        category: Category,
        status: RecordStatus,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            id,
            category,
            status,
            payload,
            modified_at: Utc::now(),
            sync_attempts: 0,
            last_sync_error: None,
            synced_at: None,
        }
    }

    /// Build a record from a loosely-typed JSON object.
    ///
    /// `id`, `category` and `status` are required. Every other key becomes
    /// part of the payload.
    ///
    /// # Errors
    /// - `Validation` if the value is not an object, a required field is
    ///   missing or not a string, or the category/status is unknown
    pub fn from_value(value: Value) -> crate::Result<Self> {
        let Value::Object(mut object) = value else {
            return Err(crate::Error::Validation(
                "Record must be a JSON object".to_string(),
            ));
        };

        let id = RecordId::new(take_required_str(&mut object, "id")?)?;
        let category: Category = take_required_str(&mut object, "category")?.parse()?;
        let status: RecordStatus = take_required_str(&mut object, "status")?.parse()?;

        let mut record = Self::new(id, category, status, Map::new());
        if let Some(Value::String(ts)) = object.remove("modified_at") {
            record.modified_at = DateTime::parse_from_rfc3339(&ts)
                .map_err(|e| crate::Error::Validation(format!("Invalid modified_at: {}", e)))?
                .with_timezone(&Utc);
        }
        record.payload = object;
        Ok(record)
    }

    /// Check identity and payload shape.
    pub fn validate(&self) -> crate::Result<()> {
        if self.id.as_str().trim().is_empty() {
            return Err(crate::Error::Validation(
                "Record id cannot be empty".to_string(),
            ));
        }
        for reserved in ["id", "category", "status"] {
            if self.payload.contains_key(reserved) {
                return Err(crate::Error::Validation(format!(
                    "Payload of {} may not carry reserved field '{}'",
                    self.id, reserved
                )));
            }
        }
        Ok(())
    }
}

fn take_required_str(object: &mut Map<String, Value>, key: &str) -> crate::Result<String> {
    match object.remove(key) {
        Some(Value::String(s)) => Ok(s),
        Some(Value::Number(n)) if key == "id" => Ok(n.to_string()),
        Some(_) => Err(crate::Error::Validation(format!(
            "Field '{}' must be a string",
            key
        ))),
        None => Err(crate::Error::Validation(format!(
            "Missing required field '{}'",
            key
        ))),
    }
}

/// Selection criteria for record queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub category: Option<Category>,
    pub status: Option<RecordStatus>,
}

impl RecordFilter {
    /// Match every record.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match every record of one category.
    pub fn category(category: Category) -> Self {
        Self {
            category: Some(category),
            status: None,
        }
    }

    /// Restrict to a single status.
    pub fn with_status(mut self, status: RecordStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Categories whose tables this filter touches.
    pub fn categories(&self) -> Vec<Category> {
        match self.category {
            Some(c) => vec![c],
            None => Category::ALL.to_vec(),
        }
    }

    pub fn matches(&self, record: &SurveyRecord) -> bool {
        self.category.is_none_or(|c| c == record.category)
            && self.status.is_none_or(|s| s == record.status)
    }
}

/// Which dashboard counter row a set of counts belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CounterScope {
    Category(Category),
    Total,
}

impl CounterScope {
    /// Every counter row that exists in a seeded store.
    pub fn all() -> [CounterScope; 3] {
        [
            CounterScope::Category(Category::ConsumerIndexing),
            CounterScope::Category(Category::MeterInstallation),
            CounterScope::Total,
        ]
    }

    /// Row key in the counters table.
    pub fn key(&self) -> &'static str {
        match self {
            CounterScope::Category(c) => c.as_str(),
            CounterScope::Total => "total",
        }
    }
}

impl fmt::Display for CounterScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.key())
    }
}

/// Cached per-status tallies shown on the dashboard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardCounters {
    pub assigned: u64,
    pub draft: u64,
    pub completed: u64,
    pub to_sync: u64,
    pub synced: u64,
    /// All records in scope.
    pub total: u64,
    /// Records locally completed at some point (completed, queued or synced).
    pub total_completed: u64,
}

impl DashboardCounters {
    /// Tally a sequence of statuses.
    pub fn tally<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = RecordStatus>,
    {
        let mut counters = Self::default();
        for status in statuses {
            match status {
                RecordStatus::Assigned => counters.assigned += 1,
                RecordStatus::Draft => counters.draft += 1,
                RecordStatus::Completed => counters.completed += 1,
                RecordStatus::ToSync => counters.to_sync += 1,
                RecordStatus::Synced => counters.synced += 1,
            }
            counters.total += 1;
            if status.counts_as_completed() {
                counters.total_completed += 1;
            }
        }
        counters
    }

    /// Count for one status.
    pub fn get(&self, status: RecordStatus) -> u64 {
        match status {
            RecordStatus::Assigned => self.assigned,
            RecordStatus::Draft => self.draft,
            RecordStatus::Completed => self.completed,
            RecordStatus::ToSync => self.to_sync,
            RecordStatus::Synced => self.synced,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

/// Why a single record's submission failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// The submission did not complete within the configured timeout.
    Timeout,
    /// The device was offline or the endpoint could not be reached.
    NetworkUnreachable(String),
    /// The server answered but did not accept the record.
    Rejected(Option<String>),
    /// Any other transport or encoding failure.
    Transport(String),
    /// The local record was removed or changed while the cycle held it.
    LocalConflict(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout => write!(f, "Timeout"),
            FailureReason::NetworkUnreachable(msg) => write!(f, "Network unreachable: {}", msg),
            FailureReason::Rejected(Some(msg)) => write!(f, "Rejected by server: {}", msg),
            FailureReason::Rejected(None) => write!(f, "Rejected by server"),
            FailureReason::Transport(msg) => write!(f, "Transport error: {}", msg),
            FailureReason::LocalConflict(msg) => write!(f, "Local conflict: {}", msg),
        }
    }
}

/// Snapshot of device connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityState {
    pub is_connected: bool,
    pub is_internet_reachable: bool,
}

impl ConnectivityState {
    pub fn online() -> Self {
        Self {
            is_connected: true,
            is_internet_reachable: true,
        }
    }

    pub fn offline() -> Self {
        Self {
            is_connected: false,
            is_internet_reachable: false,
        }
    }

    /// Whether remote submissions can be attempted.
    pub fn can_submit(&self) -> bool {
        self.is_connected && self.is_internet_reachable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_record_id_empty_fails() {
        assert!(RecordId::new("").is_err());
        assert!(RecordId::new("   ").is_err());
        assert_eq!(RecordId::new("CI-001").unwrap().as_str(), "CI-001");
    }

    #[test]
    fn test_display_honors_width() {
        let id = RecordId::new("C-1").unwrap();
        assert_eq!(format!("{:<6}|", id), "C-1   |");
        assert_eq!(
            format!("{:<20}|", Category::MeterInstallation),
            "meter_installation  |"
        );
        assert_eq!(format!("{:>9}|", RecordStatus::Draft), "    draft|");
        assert_eq!(format!("{:<7}|", CounterScope::Total), "total  |");
    }

    #[test]
    fn test_lifecycle_transitions() {
        use RecordStatus::*;
        assert!(Assigned.can_transition_to(Completed));
        assert!(Draft.can_transition_to(Completed));
        assert!(Completed.can_transition_to(ToSync));
        assert!(ToSync.can_transition_to(Synced));
        assert!(ToSync.can_transition_to(Completed));

        assert!(!Draft.can_transition_to(ToSync));
        assert!(!Completed.can_transition_to(Synced));
        assert!(!Synced.can_transition_to(Completed));
        assert!(!Draft.can_transition_to(Draft));
    }

    #[test]
    fn test_from_value() {
        let record = SurveyRecord::from_value(json!({
            "id": "CI-42",
            "category": "consumer_indexing",
            "status": "draft",
            "consumer_name": "A. Kumar",
            "load_kw": 3.5
        }))
        .unwrap();

        assert_eq!(record.id.as_str(), "CI-42");
        assert_eq!(record.category, Category::ConsumerIndexing);
        assert_eq!(record.status, RecordStatus::Draft);
        assert_eq!(record.payload.get("load_kw"), Some(&json!(3.5)));
        assert!(!record.payload.contains_key("id"));
    }

    #[test]
    fn test_from_value_rejects_missing_fields() {
        let missing_status = json!({"id": "CI-1", "category": "consumer_indexing"});
        assert!(matches!(
            SurveyRecord::from_value(missing_status),
            Err(crate::Error::Validation(_))
        ));

        let bad_status = json!({"id": "CI-1", "category": "meter", "status": "pending"});
        assert!(matches!(
            SurveyRecord::from_value(bad_status),
            Err(crate::Error::Validation(_))
        ));

        assert!(SurveyRecord::from_value(json!([1, 2, 3])).is_err());
    }

    #[test]
    fn test_filter_matches() {
        let record = SurveyRecord::new(
            RecordId::new("M-1").unwrap(),
            Category::MeterInstallation,
            RecordStatus::ToSync,
            Map::new(),
        );
        assert!(RecordFilter::all().matches(&record));
        assert!(RecordFilter::category(Category::MeterInstallation)
            .with_status(RecordStatus::ToSync)
            .matches(&record));
        assert!(!RecordFilter::category(Category::ConsumerIndexing).matches(&record));
    }

    #[test]
    fn test_tally() {
        use RecordStatus::*;
        let counters = DashboardCounters::tally([Draft, Draft, Completed, ToSync, Synced]);
        assert_eq!(counters.draft, 2);
        assert_eq!(counters.total, 5);
        assert_eq!(counters.total_completed, 3);
        assert_eq!(counters.get(ToSync), 1);
    }

    fn any_status() -> impl Strategy<Value = RecordStatus> {
        prop::sample::select(RecordStatus::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn prop_status_string_round_trip(status in any_status()) {
            let parsed: RecordStatus = status.as_str().parse().unwrap();
            prop_assert_eq!(parsed, status);
        }

        #[test]
        fn prop_tally_sums_to_total(statuses in prop::collection::vec(any_status(), 0..200)) {
            let c = DashboardCounters::tally(statuses.clone());
            prop_assert_eq!(c.total, statuses.len() as u64);
            prop_assert_eq!(c.assigned + c.draft + c.completed + c.to_sync + c.synced, c.total);
            prop_assert_eq!(c.completed + c.to_sync + c.synced, c.total_completed);
            prop_assert_eq!(c, DashboardCounters::tally(statuses));
        }
    }
}
