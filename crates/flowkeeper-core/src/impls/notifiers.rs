//! StatusNotifier implementations.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};
use tracing::info;

use crate::domain::{TaskExecutionKey, TaskStatus, TaskStatusEvent};
use crate::ports::{NotifyError, StatusNotifier};

/// Logs every event and nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl StatusNotifier for TracingNotifier {
    async fn notify(&self, event: TaskStatusEvent) -> Result<(), NotifyError> {
        info!(
            key = %event.key,
            status = %event.status,
            at = %event.timestamp,
            "task status changed"
        );
        Ok(())
    }
}

/// Forwards events into a channel owned by the embedding host.
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<TaskStatusEvent>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TaskStatusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl StatusNotifier for ChannelNotifier {
    async fn notify(&self, event: TaskStatusEvent) -> Result<(), NotifyError> {
        self.tx
            .send(event)
            .map_err(|e| NotifyError(format!("subscriber dropped: {}", e.0.key)))
    }
}

/// Keeps every event in memory.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<TaskStatusEvent>>,
    changed: Notify,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TaskStatusEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Status sequence recorded for one key.
    pub fn statuses(&self, key: &TaskExecutionKey) -> Vec<TaskStatus> {
        self.events()
            .into_iter()
            .filter(|event| &event.key == key)
            .map(|event| event.status)
            .collect()
    }

    /// Wait until at least `count` events have been recorded.
    ///
    /// Returns false on timeout.
    pub async fn wait_for_events(&self, count: usize, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.events.lock().unwrap_or_else(|e| e.into_inner()).len() >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// Wait until `key` has been reported in `status`.
    pub async fn wait_for_status(
        &self,
        key: &TaskExecutionKey,
        status: TaskStatus,
        timeout: Duration,
    ) -> bool {
        let wait = async {
            loop {
                let notified = self.changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.statuses(key).contains(&status) {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

#[async_trait]
impl StatusNotifier for RecordingNotifier {
    async fn notify(&self, event: TaskStatusEvent) -> Result<(), NotifyError> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
        self.changed.notify_waiters();
        Ok(())
    }
}
