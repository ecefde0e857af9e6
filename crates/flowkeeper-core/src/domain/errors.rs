//! Errors - executor and backend error types
//!
//! - `ExecutorError`: caller-facing. Lifecycle misuse and rejected commands surface here.
//! - `BackendError`: reported by a backend driver. The processing loop turns these
//!   into a FAILED status instead of propagating them.

use std::time::Duration;

use thiserror::Error;

use super::key::TaskExecutionKey;

#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Lifecycle misuse: an operation before `start()`, or a second `start()`.
    #[error("executor not started: {0}")]
    NotStarted(&'static str),

    #[error("invalid schedule command: {0}")]
    InvalidCommand(String),

    #[error("command queue is closed")]
    QueueClosed,

    #[error("command journal error: {0}")]
    Journal(String),

    #[error("background task failed: {0}")]
    Join(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("task execution {0} is already running")]
    AlreadyRunning(TaskExecutionKey),

    #[error("backend call for {key} timed out after {timeout:?}")]
    Timeout {
        key: TaskExecutionKey,
        timeout: Duration,
    },

    #[error("failed to launch task execution: {0}")]
    Launch(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl BackendError {
    /// The call may have taken effect anyway, or may succeed if repeated.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Timeout { .. } | BackendError::Unavailable(_))
    }
}
