//! CommandProcessor - the command-processing loop.
//!
//! One task takes commands off the queue in order and drives the backend.
//! Backend outcomes (an attempt exiting on its own) arrive on a channel and
//! are handled by the same task, so the live map has a single writer.
//!
//! Dispatch failures are isolated per command: log, FAILED, next command.
//! A START or RESTART the backend may not have carried out is handed to the
//! heartbeat monitor, which retries on its next check.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};

use super::heartbeat::HeartbeatTable;
use super::ledger::StatusLedger;
use crate::domain::{BackendError, TaskAction, TaskExecutionKey, TaskStatus};
use crate::ports::{BackendDriver, BackendHandle, ExecutionContext, ExecutionOutcome, OutcomeReport};
use crate::queue::{CommandOrigin, CommandQueue, QueuedCommand};

/// Attempts the backend confirmed as launched and that have not ended yet.
pub type LiveExecutions = Arc<RwLock<HashMap<TaskExecutionKey, BackendHandle>>>;

enum Next {
    Command(Option<QueuedCommand>),
    Outcome(OutcomeReport),
}

pub(crate) struct CommandProcessor {
    pub(crate) queue: Arc<CommandQueue>,
    pub(crate) backend: Arc<dyn BackendDriver>,
    pub(crate) ledger: Arc<StatusLedger>,
    pub(crate) live: LiveExecutions,
    pub(crate) heartbeats: Arc<HeartbeatTable>,
    pub(crate) ctx: ExecutionContext,
    pub(crate) outcomes: mpsc::UnboundedReceiver<OutcomeReport>,
    pub(crate) backend_timeout: Duration,
}

impl CommandProcessor {
    /// Runs until the queue is closed and drained.
    pub(crate) async fn run(mut self) {
        info!(backend = self.backend.name(), "command processing loop started");
        loop {
            let next = tokio::select! {
                biased;
                Some(report) = self.outcomes.recv() => Next::Outcome(report),
                entry = self.queue.take() => Next::Command(entry),
            };
            match next {
                Next::Outcome(report) => self.on_outcome(report).await,
                Next::Command(Some(entry)) => self.process(entry).await,
                Next::Command(None) => break,
            }
        }
        info!("command processing loop drained");
    }

    async fn process(&self, entry: QueuedCommand) {
        let QueuedCommand {
            seq,
            command,
            origin,
            ..
        } = entry;
        let key = command.current_task_execution.clone();
        self.ledger
            .announce_taken(seq, &key, command.action.provisional_status())
            .await;
        debug!(key = %key, seq, action = %command.action, ?origin, "processing command");

        match command.action {
            TaskAction::Start => self.start(&key).await,
            TaskAction::Stop => self.stop(&key, origin).await,
            TaskAction::Restart => match &command.new_task_execution {
                Some(new) => self.restart(&key, new).await,
                None => warn!(key = %key, seq, "RESTART without a new task execution skipped"),
            },
        }

        if let Err(e) = self.queue.ack(seq).await {
            warn!(seq, error = %e, "failed to acknowledge command");
        }
    }

    async fn start(&self, key: &TaskExecutionKey) {
        match self
            .bounded(key, self.backend.start_task_execution(key, &self.ctx))
            .await
        {
            Ok(handle) => {
                info!(key = %key, handle = %handle.id, backend = handle.backend, "task execution launched");
                self.live.write().await.insert(key.clone(), handle);
                self.heartbeats.track(key);
                self.ledger.send_task_status_change(key, TaskStatus::Running).await;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "failed to start task execution");
                // the launch may still have happened; the monitor cleans up
                if e.is_transient() {
                    self.heartbeats.needs_recovery(key, key.next_attempt());
                }
                self.ledger.send_task_status_change(key, TaskStatus::Failed).await;
            }
        }
    }

    async fn stop(&self, key: &TaskExecutionKey, origin: CommandOrigin) {
        let result = self.bounded(key, self.backend.stop_task_execution(key)).await;
        self.retire(key).await;
        let status = match result {
            // the attempt was stopped because it stopped answering
            Ok(()) if origin == CommandOrigin::Heartbeat => TaskStatus::Failed,
            Ok(()) => TaskStatus::Stopped,
            Err(e) => {
                warn!(key = %key, error = %e, "failed to stop task execution");
                TaskStatus::Failed
            }
        };
        self.ledger.send_task_status_change(key, status).await;
    }

    /// Stop `current`, and only once that is confirmed start `new`.
    async fn restart(&self, current: &TaskExecutionKey, new: &TaskExecutionKey) {
        if let Err(e) = self
            .bounded(current, self.backend.stop_task_execution(current))
            .await
        {
            warn!(key = %current, new = %new, error = %e, "restart aborted, current attempt did not stop");
            self.retire(current).await;
            if e.is_transient() {
                self.heartbeats.needs_recovery(current, new.clone());
            }
            self.ledger
                .send_task_status_change(current, TaskStatus::Failed)
                .await;
            return;
        }
        self.retire(current).await;
        self.ledger.send_task_status_change(new, TaskStatus::Queued).await;
        self.start(new).await;
    }

    async fn on_outcome(&self, report: OutcomeReport) {
        let OutcomeReport { key, outcome } = report;
        if self.live.write().await.remove(&key).is_none() {
            debug!(key = %key, ?outcome, "outcome for an attempt that is no longer live ignored");
            return;
        }
        self.heartbeats.forget(&key);
        let status = match outcome {
            ExecutionOutcome::Success => TaskStatus::Success,
            ExecutionOutcome::Failed(reason) => {
                warn!(key = %key, reason = %reason, "task execution failed");
                TaskStatus::Failed
            }
        };
        self.ledger.send_task_status_change(&key, status).await;
    }

    async fn retire(&self, key: &TaskExecutionKey) {
        self.live.write().await.remove(key);
        self.heartbeats.forget(key);
    }

    async fn bounded<T>(
        &self,
        key: &TaskExecutionKey,
        call: impl Future<Output = Result<T, BackendError>>,
    ) -> Result<T, BackendError> {
        match tokio::time::timeout(self.backend_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout {
                key: key.clone(),
                timeout: self.backend_timeout,
            }),
        }
    }
}
