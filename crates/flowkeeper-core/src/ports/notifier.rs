//! StatusNotifier port - status-change delivery to the outside world
//!
//! The notifier owns durability and fan-out (metadata store, pub/sub). The
//! executor only hands it events, one key's events in the order they happened.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::TaskStatusEvent;

#[derive(Debug, Error)]
#[error("status notification failed: {0}")]
pub struct NotifyError(pub String);

#[async_trait]
pub trait StatusNotifier: Send + Sync {
    async fn notify(&self, event: TaskStatusEvent) -> Result<(), NotifyError>;
}
