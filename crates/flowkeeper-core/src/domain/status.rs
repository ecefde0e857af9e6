//! Task execution status state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of one task execution.
///
/// State transitions:
/// - QUEUED -> RUNNING -> SUCCESS / FAILED
/// - QUEUED / RUNNING -> STOPPING -> STOPPED
/// - any non-restarting status -> RESTARTING (the replacement attempt starts at QUEUED)
/// - a finished attempt can only be restarted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Queued,
    Running,
    Stopping,
    Stopped,
    Restarting,
    Failed,
    Success,
}

impl TaskStatus {
    /// Is this a terminal state (the attempt is over)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Stopped | TaskStatus::Failed | TaskStatus::Success
        )
    }

    /// Can an attempt go from `from` to `to`?
    ///
    /// `from == None` means nothing has been emitted for the attempt yet. STOP
    /// and RESTART are accepted for unseen attempts because they may have been
    /// launched before this process started.
    pub fn can_transition(from: Option<TaskStatus>, to: TaskStatus) -> bool {
        use TaskStatus::*;
        match from {
            None => matches!(to, Queued | Stopping | Restarting),
            Some(Queued) => matches!(to, Running | Stopping | Restarting | Failed),
            Some(Running) => matches!(to, Stopping | Restarting | Failed | Success),
            Some(Stopping) => matches!(to, Stopped | Restarting | Failed),
            Some(Restarting) => matches!(to, Stopped | Failed),
            Some(Stopped) | Some(Failed) | Some(Success) => to == Restarting,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Stopping => "STOPPING",
            TaskStatus::Stopped => "STOPPED",
            TaskStatus::Restarting => "RESTARTING",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Success => "SUCCESS",
        };
        f.write_str(s)
    }
}
