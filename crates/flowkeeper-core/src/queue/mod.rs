//! Queue module: the bounded command queue between command ingress and the
//! processing loop.

mod bounded;

pub use bounded::{CommandQueue, DEFAULT_CAPACITY};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::TaskScheduleCommand;

/// Who asked for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOrigin {
    /// The scheduling master, via `schedule_task`.
    External,
    /// Synthesized by the heartbeat monitor for a dead attempt.
    Heartbeat,
}

/// One queue entry: the command plus bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedCommand {
    /// Monotonic per queue; the journal acknowledges by seq.
    pub seq: u64,
    pub command: TaskScheduleCommand,
    pub enqueued_at: DateTime<Utc>,
    pub origin: CommandOrigin,
}
