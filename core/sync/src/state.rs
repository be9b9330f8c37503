//! Sync run state and per-cycle outcome reporting.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use fieldsync_common::{Category, Error, FailureReason, RecordId, Result};

/// State of the orchestrator's sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunState {
    /// No cycle has run yet.
    Idle,
    /// A cycle is executing.
    Running,
    /// The last cycle ran to completion (possibly with per-record failures).
    Completed,
    /// The last cycle stopped on a store-level error or was dropped.
    Aborted,
}

impl RunState {
    fn as_u8(self) -> u8 {
        match self {
            RunState::Idle => 0,
            RunState::Running => 1,
            RunState::Completed => 2,
            RunState::Aborted => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => RunState::Running,
            2 => RunState::Completed,
            3 => RunState::Aborted,
            _ => RunState::Idle,
        }
    }
}

/// One record whose submission failed during a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFailure {
    pub record_id: RecordId,
    pub reason: FailureReason,
}

/// Result of one sync cycle. Reported to the caller, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    /// Category the cycle was restricted to, if any.
    pub scope: Option<Category>,
    pub submitted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<SyncFailure>,
    pub duration: Duration,
}

impl SyncOutcome {
    /// Outcome of a cycle that found nothing to submit.
    pub fn empty(scope: Option<Category>) -> Self {
        Self {
            scope,
            submitted: 0,
            succeeded: 0,
            failed: 0,
            failures: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    pub(crate) fn record_success(&mut self) {
        self.submitted += 1;
        self.succeeded += 1;
    }

    pub(crate) fn record_failure(&mut self, record_id: RecordId, reason: FailureReason) {
        self.submitted += 1;
        self.failed += 1;
        self.failures.push(SyncFailure { record_id, reason });
    }

    /// Whether every submitted record was accepted.
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// Tracks the run state and enforces at most one cycle at a time.
pub struct RunTracker {
    state: AtomicU8,
}

impl RunTracker {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(RunState::Idle.as_u8()),
        }
    }

    /// Current run state.
    pub fn state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Move to `Running` unless a cycle is already running.
    ///
    /// # Errors
    /// - `AlreadyRunning` if another cycle holds the guard
    pub fn try_begin(&self) -> Result<RunGuard<'_>> {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            if current == RunState::Running.as_u8() {
                return Err(Error::AlreadyRunning);
            }
            match self.state.compare_exchange(
                current,
                RunState::Running.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Ok(RunGuard {
                        tracker: self,
                        finished: false,
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn finish(&self, state: RunState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }
}

impl Default for RunTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Held for the duration of a running cycle.
///
/// Dropping the guard without calling `complete` marks the run `Aborted`.
pub struct RunGuard<'a> {
    tracker: &'a RunTracker,
    finished: bool,
}

impl RunGuard<'_> {
    /// End the run as `Completed`.
    pub fn complete(mut self) {
        self.finished = true;
        self.tracker.finish(RunState::Completed);
    }

    /// End the run as `Aborted`.
    pub fn abort(mut self) {
        self.finished = true;
        self.tracker.finish(RunState::Aborted);
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.tracker.finish(RunState::Aborted);
        }
    }
}
