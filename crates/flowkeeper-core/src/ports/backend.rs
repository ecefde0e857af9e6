//! BackendDriver port - where task executions actually run
//!
//! One implementation per execution environment (local processes, docker,
//! Kubernetes jobs). The executor composes exactly one of them, chosen by
//! configuration.
//!
//! # 設計原則
//! - start/stop look synchronous to the executor: they succeed, fail, or get
//!   cut off by the executor's timeout
//! - stop on an unknown or finished key is success
//! - terminal outcomes (process exit) and heartbeats flow back through
//!   `ExecutionContext`, never through return values

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::debug;

use crate::domain::{BackendError, TaskExecutionKey};

/// What the backend hands back for a launched attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendHandle {
    pub key: TaskExecutionKey,
    /// Backend-specific identifier: pid, container name, job name.
    pub id: String,
    pub backend: &'static str,
    pub launched_at: DateTime<Utc>,
}

/// How an attempt ended on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Success,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeReport {
    pub key: TaskExecutionKey,
    pub outcome: ExecutionOutcome,
}

/// Receives liveness signals for running attempts.
pub trait HeartbeatSink: Send + Sync {
    fn beat(&self, key: &TaskExecutionKey);
}

/// Channels a backend uses to talk back to the executor.
#[derive(Clone)]
pub struct ExecutionContext {
    outcomes: mpsc::UnboundedSender<OutcomeReport>,
    heartbeats: Arc<dyn HeartbeatSink>,
}

impl ExecutionContext {
    pub fn new(
        outcomes: mpsc::UnboundedSender<OutcomeReport>,
        heartbeats: Arc<dyn HeartbeatSink>,
    ) -> Self {
        Self {
            outcomes,
            heartbeats,
        }
    }

    /// A context nobody listens to.
    pub fn detached() -> Self {
        struct Discard;
        impl HeartbeatSink for Discard {
            fn beat(&self, _key: &TaskExecutionKey) {}
        }
        let (tx, _rx) = mpsc::unbounded_channel();
        Self::new(tx, Arc::new(Discard))
    }

    pub fn report_outcome(&self, key: TaskExecutionKey, outcome: ExecutionOutcome) {
        // receiver gone means the executor already stopped
        if self.outcomes.send(OutcomeReport { key, outcome }).is_err() {
            debug!("outcome dropped: executor is no longer listening");
        }
    }

    pub fn heartbeat(&self, key: &TaskExecutionKey) {
        self.heartbeats.beat(key);
    }
}

#[async_trait]
pub trait BackendDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Launch an attempt. Starting a key that is already running is
    /// `BackendError::AlreadyRunning`.
    async fn start_task_execution(
        &self,
        key: &TaskExecutionKey,
        ctx: &ExecutionContext,
    ) -> Result<BackendHandle, BackendError>;

    /// Request termination. Unknown or already-stopped keys are `Ok`.
    async fn stop_task_execution(&self, key: &TaskExecutionKey) -> Result<(), BackendError>;

    /// Release backend resources when the executor stops.
    async fn shutdown(&self) {}
}
