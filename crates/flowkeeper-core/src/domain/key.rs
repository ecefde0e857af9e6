//! Task execution identity.
//!
//! A task execution (attempt) is one concrete run of a logical task inside a
//! workflow execution. Restarting a task never reuses a key: the replacement
//! attempt gets the same workflow execution and task name with a larger
//! attempt number.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one task attempt: `(workflow_execution_id, task_name, attempt)`.
///
/// Equality, hashing and ordering use the whole tuple, so two attempts of the
/// same task are different keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskExecutionKey {
    workflow_execution_id: i64,
    task_name: String,
    #[serde(alias = "seq_num")]
    attempt: u32,
}

impl TaskExecutionKey {
    pub fn new(workflow_execution_id: i64, task_name: impl Into<String>, attempt: u32) -> Self {
        Self {
            workflow_execution_id,
            task_name: task_name.into(),
            attempt,
        }
    }

    pub fn workflow_execution_id(&self) -> i64 {
        self.workflow_execution_id
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Key of the attempt that replaces this one on restart.
    pub fn next_attempt(&self) -> Self {
        Self {
            workflow_execution_id: self.workflow_execution_id,
            task_name: self.task_name.clone(),
            attempt: self.attempt.saturating_add(1),
        }
    }

    /// Same workflow execution and task name, ignoring the attempt number.
    pub fn same_task(&self, other: &Self) -> bool {
        self.workflow_execution_id == other.workflow_execution_id
            && self.task_name == other.task_name
    }

    /// True if `other` is a later attempt of the same task.
    pub fn is_succeeded_by(&self, other: &Self) -> bool {
        self.same_task(other) && other.attempt > self.attempt
    }

    /// Fill `{workflow_execution_id}`, `{task_name}` and `{attempt}` in a
    /// command-line template.
    pub fn render(&self, template: &str) -> String {
        template
            .replace("{workflow_execution_id}", &self.workflow_execution_id.to_string())
            .replace("{task_name}", &self.task_name)
            .replace("{attempt}", &self.attempt.to_string())
    }

    /// A name usable for containers and Kubernetes objects
    /// (lowercase alphanumerics and `-`, at most 63 chars).
    ///
    /// The task name is sanitized and may be truncated, so a hash of the raw
    /// name keeps distinct keys on distinct names.
    pub fn resource_name(&self, prefix: &str) -> String {
        let task: String = self
            .task_name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect();
        let suffix = format!(
            "-{:08x}-{}-{}",
            name_hash(&self.task_name),
            self.workflow_execution_id,
            self.attempt
        );
        let room = 63usize.saturating_sub(prefix.len() + 1 + suffix.len());
        let task: String = task.trim_matches('-').chars().take(room).collect();
        format!("{prefix}-{}{suffix}", task.trim_end_matches('-'))
            .replace("--", "-")
    }
}

/// FNV-1a, folded to 32 bits. Stable across builds and platforms.
fn name_hash(name: &str) -> u32 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;
    let hash = name.bytes().fold(FNV_OFFSET, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
    });
    (hash ^ (hash >> 32)) as u32
}

impl fmt::Display for TaskExecutionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "wf-{}/{}#{}",
            self.workflow_execution_id, self.task_name, self.attempt
        )
    }
}
