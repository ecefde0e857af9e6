//! Events - status-change events delivered to the notifier

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::key::TaskExecutionKey;
use super::status::TaskStatus;

/// A task execution moved to `status` at `timestamp`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatusEvent {
    pub key: TaskExecutionKey,
    pub status: TaskStatus,
    pub timestamp: DateTime<Utc>,
}

impl TaskStatusEvent {
    pub fn new(key: TaskExecutionKey, status: TaskStatus, timestamp: DateTime<Utc>) -> Self {
        Self {
            key,
            status,
            timestamp,
        }
    }
}
