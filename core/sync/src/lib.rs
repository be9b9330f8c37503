//! FieldSync Sync Engine
//!
//! This module drives synchronization of locally stored survey records
//! with the remote backend, including:
//! - A single-run sync cycle with per-record failure isolation and rollback
//! - Connectivity monitoring with ordered, unsubscribable notifications
//! - A remote submission collaborator trait and its HTTP implementation
//! - Exponential backoff for records whose endpoint is unreachable
//! - Manual, reconnect-triggered and periodic scheduling

pub mod config;
pub mod network;
pub mod orchestrator;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod submit;

// Re-export main types
pub use config::EngineConfig;
pub use network::{ConnectivityProbe, HttpProbe, NetworkMonitor, StaticProbe, Subscription};
pub use orchestrator::{SyncConfig, SyncOrchestrator};
pub use retry::{RetryConfig, RetryExecutor};
pub use scheduler::{SyncMode, SyncRequest, SyncScheduler, SyncSchedulerHandle};
pub use state::{RunState, RunTracker, SyncFailure, SyncOutcome};
pub use submit::{HttpSubmissionClient, SubmissionClient, SubmissionPayload, SubmissionResponse};
