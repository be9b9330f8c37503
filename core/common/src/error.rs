//! Common error types for FieldSync.

use thiserror::Error;

use crate::types::{FailureReason, RecordId, RecordStatus};

/// Top-level error type for FieldSync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Local store could not be opened or has not been initialized.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Storage operation failed on an open store.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Malformed record on insert or update.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Record not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Status change not allowed by the record lifecycle.
    #[error("Invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: RecordId,
        from: RecordStatus,
        to: RecordStatus,
    },

    /// Remote submission of a single record failed.
    #[error("Submission failed: {0}")]
    Submission(FailureReason),

    /// A sync cycle is already in progress.
    #[error("A sync cycle is already running")]
    AlreadyRunning,

    /// Transport-level network failure.
    #[error("Network error: {0}")]
    Network(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error aborts the whole operation rather than a single record.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::StorageUnavailable(_) | Error::Storage(_) | Error::Validation(_)
        )
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
