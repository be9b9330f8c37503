//! Common utilities and types shared across FieldSync modules.
//!
//! This module provides the record model, the status lifecycle and the
//! error taxonomy used by the storage and sync crates.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{
    Category, ConnectivityState, CounterScope, DashboardCounters, FailureReason, RecordFilter,
    RecordId, RecordStatus, SurveyRecord,
};
