//! Schedule commands sent by the scheduling master.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::ExecutorError;
use super::key::TaskExecutionKey;
use super::status::TaskStatus;

/// Action requested on a task execution. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskAction {
    Start,
    Stop,
    Restart,
}

impl TaskAction {
    /// Status announced as soon as a command with this action is accepted.
    pub fn provisional_status(self) -> TaskStatus {
        match self {
            TaskAction::Start => TaskStatus::Queued,
            TaskAction::Stop => TaskStatus::Stopping,
            TaskAction::Restart => TaskStatus::Restarting,
        }
    }
}

impl fmt::Display for TaskAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskAction::Start => "START",
            TaskAction::Stop => "STOP",
            TaskAction::Restart => "RESTART",
        };
        f.write_str(s)
    }
}

/// A request to start, stop or restart one task execution.
///
/// `new_task_execution` is present exactly when the action is RESTART, and
/// then names a later attempt of the same task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskScheduleCommand {
    pub action: TaskAction,
    pub current_task_execution: TaskExecutionKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_task_execution: Option<TaskExecutionKey>,
}

impl TaskScheduleCommand {
    pub fn start(key: TaskExecutionKey) -> Self {
        Self {
            action: TaskAction::Start,
            current_task_execution: key,
            new_task_execution: None,
        }
    }

    pub fn stop(key: TaskExecutionKey) -> Self {
        Self {
            action: TaskAction::Stop,
            current_task_execution: key,
            new_task_execution: None,
        }
    }

    pub fn restart(current: TaskExecutionKey, new: TaskExecutionKey) -> Self {
        Self {
            action: TaskAction::Restart,
            current_task_execution: current,
            new_task_execution: Some(new),
        }
    }

    pub fn validate(&self) -> Result<(), ExecutorError> {
        let current = &self.current_task_execution;
        match (self.action, &self.new_task_execution) {
            (TaskAction::Restart, None) => Err(ExecutorError::InvalidCommand(format!(
                "RESTART of {current} has no new task execution"
            ))),
            (TaskAction::Restart, Some(new)) if !current.is_succeeded_by(new) => {
                Err(ExecutorError::InvalidCommand(format!(
                    "{new} is not a later attempt of {current}"
                )))
            }
            (TaskAction::Restart, Some(_)) => Ok(()),
            (action, Some(new)) => Err(ExecutorError::InvalidCommand(format!(
                "{action} of {current} must not carry a new task execution ({new})"
            ))),
            (_, None) => Ok(()),
        }
    }
}
