//! Offline-first local persistence for FieldSync.
//!
//! This module owns every piece of persisted state on the device:
//! - `LocalStore`: SQLite tables for survey records and dashboard counters
//! - `CounterAggregator`: full-scan recompute of the dashboard counters
//! - `SyncQueueSelector`: side-effect-free view of what is pending
//! - `BatchImporter`: full-category replace for master-data imports
//!
//! # Design Principles
//! - Single writer: every mutation goes through the store's own lock and
//!   transaction boundary
//! - Derived counters: counters are recomputed, never incremented
//! - Queue membership is derived from record status, there is no queue table

pub mod counters;
pub mod import;
pub mod queue;
pub mod store;

pub use counters::CounterAggregator;
pub use import::{parse_batch, BatchImporter};
pub use queue::SyncQueueSelector;
pub use store::{LocalStore, SCHEMA_VERSION};
