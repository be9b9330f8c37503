//! SQLite-backed local store for survey records and dashboard counters.
//!
//! Records of each category live in their own table. Queue membership is
//! derived from the `status` column; there is no separate queue table.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use fieldsync_common::{
    Category, CounterScope, DashboardCounters, Error, RecordFilter, RecordId, RecordStatus,
    Result, SurveyRecord,
};

/// Current schema version, stored in the metadata table.
pub const SCHEMA_VERSION: u32 = 1;

const RECORD_COLUMNS: &str =
    "id, status, payload, modified_at, sync_attempts, last_sync_error, synced_at";

/// Where the database lives.
#[derive(Debug, Clone)]
enum Location {
    File(PathBuf),
    Memory,
}

/// Durable, transactional storage for survey records and counters.
///
/// The store is created closed; `initialize` opens the connection and
/// applies the schema. Every other operation fails with
/// `StorageUnavailable` until then.
pub struct LocalStore {
    location: Location,
    conn: Mutex<Option<Connection>>,
}

impl LocalStore {
    /// Create a store backed by a database file. Nothing is opened yet.
    pub fn open(db_path: impl AsRef<Path>) -> Self {
        Self {
            location: Location::File(db_path.as_ref().to_path_buf()),
            conn: Mutex::new(None),
        }
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Self {
        Self {
            location: Location::Memory,
            conn: Mutex::new(None),
        }
    }

    /// Open the database, apply the schema if absent and seed zeroed counters.
    ///
    /// Calling this on an already initialized store is a no-op.
    ///
    /// # Errors
    /// - `StorageUnavailable` if the database cannot be opened or migrated
    pub async fn initialize(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        if guard.is_some() {
            debug!("Local store already initialized");
            return Ok(());
        }

        let mut conn = match &self.location {
            Location::File(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        Error::StorageUnavailable(format!(
                            "Cannot create {}: {}",
                            parent.display(),
                            e
                        ))
                    })?;
                }
                Connection::open(path)
            }
            Location::Memory => Connection::open_in_memory(),
        }
        .map_err(|e| Error::StorageUnavailable(e.to_string()))?;

        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
        apply_schema(&mut conn).map_err(|e| Error::StorageUnavailable(e.to_string()))?;

        info!("Local store opened ({:?})", self.location);
        *guard = Some(conn);
        Ok(())
    }

    /// Whether `initialize` has succeeded.
    pub async fn is_initialized(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    /// Run a closure against the open connection, serialized by the store lock.
    async fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(|| {
            Error::StorageUnavailable("Local store is not initialized".to_string())
        })?;
        f(conn)
    }

    /// Insert or update a record by identity.
    ///
    /// Local saves may create records in `Assigned`, `Draft` or `Completed`
    /// and may move an existing record between those states (including the
    /// re-edit of a `Synced` record). `ToSync` and `Synced` are reachable only
    /// through [`update_status`](Self::update_status), and a queued `ToSync`
    /// record cannot be saved at all. A local edit resets the record's
    /// failure bookkeeping.
    ///
    /// # Errors
    /// - `Validation` if the record is malformed or its id belongs to the
    ///   other category
    /// - `InvalidTransition` if the record is queued for sync or the save
    ///   would move it into a sync-owned state
    pub async fn upsert_record(&self, record: &SurveyRecord) -> Result<SurveyRecord> {
        record.validate()?;
        let payload = encode_payload(record)?;

        self.with_conn(|conn| {
            let tx = conn.transaction().map_err(storage_err)?;
            let existing = find_record(&tx, &record.id)?;

            match &existing {
                Some((category, _)) if *category != record.category => {
                    return Err(Error::Validation(format!(
                        "Record {} already exists in {}",
                        record.id, category
                    )));
                }
                Some((_, stored)) if stored.status == RecordStatus::ToSync => {
                    return Err(Error::InvalidTransition {
                        id: record.id.clone(),
                        from: stored.status,
                        to: record.status,
                    });
                }
                Some((_, stored)) => {
                    if stored.status != record.status && !record.status.is_initial() {
                        return Err(Error::InvalidTransition {
                            id: record.id.clone(),
                            from: stored.status,
                            to: record.status,
                        });
                    }
                }
                None if !record.status.is_initial() => {
                    return Err(Error::Validation(format!(
                        "Record {} cannot be created in status {}",
                        record.id, record.status
                    )));
                }
                None => {}
            }

            tx.execute(
                &format!(
                    "INSERT INTO {} (id, status, payload, modified_at, sync_attempts)
                     VALUES (?1, ?2, ?3, ?4, 0)
                     ON CONFLICT(id) DO UPDATE SET
                        status = excluded.status,
                        payload = excluded.payload,
                        modified_at = excluded.modified_at,
                        sync_attempts = 0,
                        last_sync_error = NULL",
                    record.category.table_name()
                ),
                params![
                    record.id.as_str(),
                    record.status.as_str(),
                    payload,
                    monotonic_micros()
                ],
            )
            .map_err(storage_err)?;

            let stored = load_record(&tx, record.category, &record.id)?;
            tx.commit().map_err(storage_err)?;
            debug!("Upserted record {} ({})", record.id, record.status);
            Ok(stored)
        })
        .await
    }

    /// Get a single record by identity.
    pub async fn get_record(&self, id: &RecordId) -> Result<Option<SurveyRecord>> {
        self.with_conn(|conn| Ok(find_record(conn, id)?.map(|(_, record)| record)))
            .await
    }

    /// Return all records matching the filter, ordered by last modification.
    pub async fn query_records(&self, filter: RecordFilter) -> Result<Vec<SurveyRecord>> {
        self.with_conn(|conn| {
            let mut records = Vec::new();
            for category in filter.categories() {
                let mut sql = format!(
                    "SELECT {} FROM {}",
                    RECORD_COLUMNS,
                    category.table_name()
                );
                if filter.status.is_some() {
                    sql.push_str(" WHERE status = ?1");
                }
                sql.push_str(" ORDER BY modified_at, seq");

                let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
                let rows = match filter.status {
                    Some(status) => stmt.query_map([status.as_str()], RawRecord::from_row),
                    None => stmt.query_map([], RawRecord::from_row),
                }
                .map_err(storage_err)?;

                for raw in rows {
                    records.push(raw.map_err(storage_err)?.into_record(category)?);
                }
            }
            records.sort_by_key(|r| r.modified_at);
            Ok(records)
        })
        .await
    }

    /// Transition a single record's status.
    ///
    /// Moving to `Synced` stamps `synced_at` and clears failure bookkeeping.
    ///
    /// # Errors
    /// - `NotFound` if no record has this identity
    /// - `InvalidTransition` if the lifecycle forbids the change
    pub async fn update_status(
        &self,
        id: &RecordId,
        new_status: RecordStatus,
    ) -> Result<SurveyRecord> {
        self.with_conn(|conn| {
            let tx = conn.transaction().map_err(storage_err)?;
            let (category, current) = require_transition(&tx, id, new_status)?;
            let now = monotonic_micros();

            if new_status == RecordStatus::Synced {
                tx.execute(
                    &format!(
                        "UPDATE {} SET status = ?2, modified_at = ?3, synced_at = ?3,
                            sync_attempts = 0, last_sync_error = NULL
                         WHERE id = ?1",
                        category.table_name()
                    ),
                    params![id.as_str(), new_status.as_str(), now],
                )
            } else {
                tx.execute(
                    &format!(
                        "UPDATE {} SET status = ?2, modified_at = ?3 WHERE id = ?1",
                        category.table_name()
                    ),
                    params![id.as_str(), new_status.as_str(), now],
                )
            }
            .map_err(storage_err)?;

            let updated = load_record(&tx, category, id)?;
            tx.commit().map_err(storage_err)?;
            debug!("Record {}: {} -> {}", id, current.status, new_status);
            Ok(updated)
        })
        .await
    }

    /// Roll a failed submission back from `ToSync` to `Completed`, recording why.
    ///
    /// The record stays eligible for the next sync cycle.
    pub async fn record_sync_failure(&self, id: &RecordId, reason: &str) -> Result<SurveyRecord> {
        self.with_conn(|conn| {
            let tx = conn.transaction().map_err(storage_err)?;
            let (category, current) = require_transition(&tx, id, RecordStatus::Completed)?;
            if current.status != RecordStatus::ToSync {
                return Err(Error::InvalidTransition {
                    id: id.clone(),
                    from: current.status,
                    to: RecordStatus::Completed,
                });
            }

            tx.execute(
                &format!(
                    "UPDATE {} SET status = ?2, modified_at = ?3,
                        sync_attempts = sync_attempts + 1, last_sync_error = ?4
                     WHERE id = ?1",
                    category.table_name()
                ),
                params![
                    id.as_str(),
                    RecordStatus::Completed.as_str(),
                    monotonic_micros(),
                    reason
                ],
            )
            .map_err(storage_err)?;

            let updated = load_record(&tx, category, id)?;
            tx.commit().map_err(storage_err)?;
            warn!("Record {} rolled back to completed: {}", id, reason);
            Ok(updated)
        })
        .await
    }

    /// Replace every record of one category with a new set, atomically.
    ///
    /// Records may carry any status. Returns the number of rows inserted.
    ///
    /// # Errors
    /// - `Validation` if any record is malformed, belongs to another category,
    ///   is duplicated within the batch or collides with an id of the other
    ///   category. Nothing is written in that case.
    pub async fn replace_category(
        &self,
        category: Category,
        records: &[SurveyRecord],
    ) -> Result<usize> {
        let mut seen = HashSet::new();
        let mut encoded = Vec::with_capacity(records.len());
        for record in records {
            record.validate()?;
            if record.category != category {
                return Err(Error::Validation(format!(
                    "Record {} belongs to {}, not {}",
                    record.id, record.category, category
                )));
            }
            if !seen.insert(record.id.as_str()) {
                return Err(Error::Validation(format!(
                    "Duplicate record id {} in batch",
                    record.id
                )));
            }
            encoded.push((record, encode_payload(record)?));
        }

        self.with_conn(|conn| {
            let tx = conn.transaction().map_err(storage_err)?;

            for other in Category::ALL.into_iter().filter(|c| *c != category) {
                let mut stmt = tx
                    .prepare(&format!("SELECT 1 FROM {} WHERE id = ?1", other.table_name()))
                    .map_err(storage_err)?;
                for (record, _) in &encoded {
                    if stmt.exists([record.id.as_str()]).map_err(storage_err)? {
                        return Err(Error::Validation(format!(
                            "Record {} already exists in {}",
                            record.id, other
                        )));
                    }
                }
            }

            tx.execute(&format!("DELETE FROM {}", category.table_name()), [])
                .map_err(storage_err)?;

            {
                let mut stmt = tx
                    .prepare(&format!(
                        "INSERT INTO {} ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        category.table_name(),
                        RECORD_COLUMNS
                    ))
                    .map_err(storage_err)?;
                for (record, payload) in &encoded {
                    stmt.execute(params![
                        record.id.as_str(),
                        record.status.as_str(),
                        payload,
                        record.modified_at.timestamp_micros(),
                        record.sync_attempts,
                        record.last_sync_error,
                        record.synced_at.map(|t| t.timestamp_micros()),
                    ])
                    .map_err(storage_err)?;
                }
            }

            tx.commit().map_err(storage_err)?;
            info!("Replaced {} with {} records", category, encoded.len());
            Ok(encoded.len())
        })
        .await
    }

    /// Delete every record and counter, then reseed zeroed counters.
    ///
    /// Leaves the store in the same state as a fresh `initialize`.
    pub async fn clear_all(&self) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction().map_err(storage_err)?;
            for category in Category::ALL {
                tx.execute(&format!("DELETE FROM {}", category.table_name()), [])
                    .map_err(storage_err)?;
            }
            tx.execute("DELETE FROM dashboard_counters", [])
                .map_err(storage_err)?;
            seed_counters(&tx)?;
            tx.commit().map_err(storage_err)?;
            info!("Cleared local store");
            Ok(())
        })
        .await
    }

    /// Raw row count for one category. Does not consult the counters.
    pub async fn count(&self, category: Category) -> Result<u64> {
        self.with_conn(|conn| count_rows(conn, category)).await
    }

    /// Raw row count across all categories.
    pub async fn count_all(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let mut total = 0;
            for category in Category::ALL {
                total += count_rows(conn, category)?;
            }
            Ok(total)
        })
        .await
    }

    /// Records eligible for synchronization, oldest edits first.
    ///
    /// Eligible means queued (`ToSync`) or rolled back after a failed
    /// submission (`Completed` with at least one recorded attempt).
    pub(crate) async fn pending(&self, category: Option<Category>) -> Result<Vec<SurveyRecord>> {
        let filter = RecordFilter {
            category,
            status: None,
        };
        self.with_conn(|conn| {
            let mut records = Vec::new();
            for category in filter.categories() {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {} FROM {} WHERE {} ORDER BY modified_at, seq",
                        RECORD_COLUMNS,
                        category.table_name(),
                        PENDING_PREDICATE
                    ))
                    .map_err(storage_err)?;
                let rows = stmt
                    .query_map([], RawRecord::from_row)
                    .map_err(storage_err)?;
                for raw in rows {
                    records.push(raw.map_err(storage_err)?.into_record(category)?);
                }
            }
            records.sort_by_key(|r| r.modified_at);
            Ok(records)
        })
        .await
    }

    /// Count of records `pending` would return, from the same predicate.
    pub(crate) async fn pending_count(&self, category: Option<Category>) -> Result<u64> {
        let filter = RecordFilter {
            category,
            status: None,
        };
        self.with_conn(|conn| {
            let mut total = 0;
            for category in filter.categories() {
                let count: i64 = conn
                    .query_row(
                        &format!(
                            "SELECT COUNT(*) FROM {} WHERE {}",
                            category.table_name(),
                            PENDING_PREDICATE
                        ),
                        [],
                        |row| row.get(0),
                    )
                    .map_err(storage_err)?;
                total += count as u64;
            }
            Ok(total)
        })
        .await
    }

    /// Read the cached counters for one scope.
    pub async fn counters(&self, scope: CounterScope) -> Result<DashboardCounters> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT assigned, draft, completed, to_sync, synced, total, total_completed
                 FROM dashboard_counters WHERE scope = ?1",
                [scope.key()],
                |row| {
                    Ok(DashboardCounters {
                        assigned: row.get::<_, i64>(0)? as u64,
                        draft: row.get::<_, i64>(1)? as u64,
                        completed: row.get::<_, i64>(2)? as u64,
                        to_sync: row.get::<_, i64>(3)? as u64,
                        synced: row.get::<_, i64>(4)? as u64,
                        total: row.get::<_, i64>(5)? as u64,
                        total_completed: row.get::<_, i64>(6)? as u64,
                    })
                },
            )
            .optional()
            .map_err(storage_err)?
            .ok_or_else(|| Error::NotFound(format!("Counters for {}", scope)))
        })
        .await
    }

    /// Overwrite counter rows in one transaction. Only the aggregator calls this.
    pub(crate) async fn replace_counters(
        &self,
        rows: &[(CounterScope, DashboardCounters)],
    ) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction().map_err(storage_err)?;
            let now = Utc::now().timestamp_micros();
            for (scope, c) in rows {
                tx.execute(
                    "INSERT OR REPLACE INTO dashboard_counters
                     (scope, assigned, draft, completed, to_sync, synced, total,
                      total_completed, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        scope.key(),
                        c.assigned as i64,
                        c.draft as i64,
                        c.completed as i64,
                        c.to_sync as i64,
                        c.synced as i64,
                        c.total as i64,
                        c.total_completed as i64,
                        now
                    ],
                )
                .map_err(storage_err)?;
            }
            tx.commit().map_err(storage_err)?;
            Ok(())
        })
        .await
    }
}

const PENDING_PREDICATE: &str =
    "status = 'to_sync' OR (status = 'completed' AND sync_attempts > 0)";

/// Microsecond timestamp that never repeats or goes backwards within the
/// process, so queue order by `modified_at` follows mutation order.
fn monotonic_micros() -> i64 {
    static LAST: AtomicI64 = AtomicI64::new(0);
    let now = Utc::now().timestamp_micros();
    let mut prev = LAST.load(Ordering::Relaxed);
    loop {
        let next = now.max(prev + 1);
        match LAST.compare_exchange_weak(prev, next, Ordering::SeqCst, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => prev = actual,
        }
    }
}

fn storage_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

fn apply_schema(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction().map_err(storage_err)?;
    for category in Category::ALL {
        tx.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                seq INTEGER PRIMARY KEY,
                id TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL CHECK (status IN
                    ('assigned', 'draft', 'completed', 'to_sync', 'synced')),
                payload TEXT NOT NULL,
                modified_at INTEGER NOT NULL,
                sync_attempts INTEGER NOT NULL DEFAULT 0,
                last_sync_error TEXT,
                synced_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_{table}_status ON {table}(status, modified_at);
            "#,
            table = category.table_name()
        ))
        .map_err(storage_err)?;
    }

    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS dashboard_counters (
            scope TEXT PRIMARY KEY,
            assigned INTEGER NOT NULL DEFAULT 0,
            draft INTEGER NOT NULL DEFAULT 0,
            completed INTEGER NOT NULL DEFAULT 0,
            to_sync INTEGER NOT NULL DEFAULT 0,
            synced INTEGER NOT NULL DEFAULT 0,
            total INTEGER NOT NULL DEFAULT 0,
            total_completed INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER
        );

        CREATE TABLE IF NOT EXISTS store_metadata (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
    )
    .map_err(storage_err)?;

    seed_counters(&tx)?;
    tx.execute(
        "INSERT OR IGNORE INTO store_metadata (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )
    .map_err(storage_err)?;

    let stored: String = tx
        .query_row(
            "SELECT value FROM store_metadata WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .map_err(storage_err)?;
    if stored.parse::<u32>().map_or(true, |version| version > SCHEMA_VERSION) {
        return Err(Error::Storage(format!(
            "Unsupported schema version {} (this build reads up to {})",
            stored, SCHEMA_VERSION
        )));
    }
    tx.commit().map_err(storage_err)
}

/// Insert a zero row for every counter scope that has none.
fn seed_counters(tx: &Transaction<'_>) -> Result<()> {
    for scope in CounterScope::all() {
        tx.execute(
            "INSERT OR IGNORE INTO dashboard_counters (scope) VALUES (?1)",
            [scope.key()],
        )
        .map_err(storage_err)?;
    }
    Ok(())
}

fn count_rows(conn: &Connection, category: Category) -> Result<u64> {
    let count: i64 = conn
        .query_row(
            &format!("SELECT COUNT(*) FROM {}", category.table_name()),
            [],
            |row| row.get(0),
        )
        .map_err(storage_err)?;
    Ok(count as u64)
}

fn encode_payload(record: &SurveyRecord) -> Result<String> {
    serde_json::to_string(&record.payload).map_err(|e| Error::Serialization(e.to_string()))
}

/// Locate a record in whichever category table holds it.
fn find_record(conn: &Connection, id: &RecordId) -> Result<Option<(Category, SurveyRecord)>> {
    for category in Category::ALL {
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {} FROM {} WHERE id = ?1",
                    RECORD_COLUMNS,
                    category.table_name()
                ),
                [id.as_str()],
                RawRecord::from_row,
            )
            .optional()
            .map_err(storage_err)?;
        if let Some(raw) = raw {
            return Ok(Some((category, raw.into_record(category)?)));
        }
    }
    Ok(None)
}

fn load_record(conn: &Connection, category: Category, id: &RecordId) -> Result<SurveyRecord> {
    conn.query_row(
        &format!(
            "SELECT {} FROM {} WHERE id = ?1",
            RECORD_COLUMNS,
            category.table_name()
        ),
        [id.as_str()],
        RawRecord::from_row,
    )
    .optional()
    .map_err(storage_err)?
    .ok_or_else(|| Error::NotFound(format!("Record {}", id)))?
    .into_record(category)
}

/// Find the record and check that the lifecycle allows moving it to `to`.
fn require_transition(
    conn: &Connection,
    id: &RecordId,
    to: RecordStatus,
) -> Result<(Category, SurveyRecord)> {
    let (category, current) =
        find_record(conn, id)?.ok_or_else(|| Error::NotFound(format!("Record {}", id)))?;
    if !current.status.can_transition_to(to) {
        return Err(Error::InvalidTransition {
            id: id.clone(),
            from: current.status,
            to,
        });
    }
    Ok((category, current))
}

/// A record row before its columns are parsed into domain types.
struct RawRecord {
    id: String,
    status: String,
    payload: String,
    modified_at: i64,
    sync_attempts: u32,
    last_sync_error: Option<String>,
    synced_at: Option<i64>,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            status: row.get(1)?,
            payload: row.get(2)?,
            modified_at: row.get(3)?,
            sync_attempts: row.get(4)?,
            last_sync_error: row.get(5)?,
            synced_at: row.get(6)?,
        })
    }

    fn into_record(self, category: Category) -> Result<SurveyRecord> {
        let payload = serde_json::from_str(&self.payload)
            .map_err(|e| Error::Serialization(format!("Payload of {}: {}", self.id, e)))?;
        Ok(SurveyRecord {
            id: RecordId::new(self.id)?,
            category,
            status: self.status.parse()?,
            payload,
            modified_at: from_micros(self.modified_at)?,
            sync_attempts: self.sync_attempts,
            last_sync_error: self.last_sync_error,
            synced_at: self.synced_at.map(from_micros).transpose()?,
        })
    }
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| Error::Storage(format!("Invalid timestamp {}", micros)))
}
