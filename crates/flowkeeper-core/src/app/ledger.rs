//! StatusLedger - the single path by which status changes leave the executor.
//!
//! Every emission takes one lock, so per key the notifier sees events in the
//! order they were applied. Consecutive duplicates and transitions the
//! lifecycle does not allow are dropped here.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::{TaskExecutionKey, TaskStatus, TaskStatusEvent};
use crate::ports::{Clock, StatusNotifier};

#[derive(Default)]
struct LedgerState {
    last: HashMap<TaskExecutionKey, TaskStatus>,
    /// Seqs announced by the submitting caller that the loop has not taken yet.
    announced: HashSet<u64>,
    /// Highest seq the loop has taken. The queue hands out seqs in order.
    taken_through: u64,
}

pub struct StatusLedger {
    notifier: Arc<dyn StatusNotifier>,
    clock: Arc<dyn Clock>,
    state: Mutex<LedgerState>,
}

impl StatusLedger {
    pub fn new(notifier: Arc<dyn StatusNotifier>, clock: Arc<dyn Clock>) -> Self {
        Self {
            notifier,
            clock,
            state: Mutex::new(LedgerState::default()),
        }
    }

    /// Emit `status` for `key`. Returns whether an event was sent.
    pub async fn send_task_status_change(&self, key: &TaskExecutionKey, status: TaskStatus) -> bool {
        let mut state = self.state.lock().await;
        self.emit_locked(&mut state, key, status).await
    }

    /// Provisional status of queue entry `seq`, from the caller that enqueued it.
    ///
    /// The caller and the processing loop (`announce_taken`) both announce;
    /// whichever comes first emits, the other is a no-op. This keeps the
    /// provisional status ahead of everything the loop emits for the same
    /// command.
    pub async fn announce(&self, seq: u64, key: &TaskExecutionKey, status: TaskStatus) {
        let mut state = self.state.lock().await;
        if seq <= state.taken_through {
            return;
        }
        state.announced.insert(seq);
        self.emit_locked(&mut state, key, status).await;
    }

    /// Provisional status of queue entry `seq`, from the processing loop.
    ///
    /// Entries replayed from the journal, or whose caller went away before
    /// announcing, are only ever announced here.
    pub async fn announce_taken(&self, seq: u64, key: &TaskExecutionKey, status: TaskStatus) {
        let mut state = self.state.lock().await;
        state.taken_through = state.taken_through.max(seq);
        if state.announced.remove(&seq) {
            return;
        }
        self.emit_locked(&mut state, key, status).await;
    }

    #[cfg(test)]
    pub(crate) async fn pending_announcements(&self) -> usize {
        self.state.lock().await.announced.len()
    }

    pub async fn last_status(&self, key: &TaskExecutionKey) -> Option<TaskStatus> {
        self.state.lock().await.last.get(key).copied()
    }

    async fn emit_locked(
        &self,
        state: &mut LedgerState,
        key: &TaskExecutionKey,
        status: TaskStatus,
    ) -> bool {
        let previous = state.last.get(key).copied();
        if previous == Some(status) {
            debug!(key = %key, status = %status, "duplicate status dropped");
            return false;
        }
        if !TaskStatus::can_transition(previous, status) {
            warn!(key = %key, from = ?previous, to = %status, "status transition not allowed, dropped");
            return false;
        }
        state.last.insert(key.clone(), status);

        let event = TaskStatusEvent::new(key.clone(), status, self.clock.now());
        info!(key = %key, status = %status, "task status");
        // delivery problems are the notifier's to handle; the lifecycle moves on
        if let Err(e) = self.notifier.notify(event).await {
            warn!(key = %key, status = %status, error = %e, "status notification failed");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::RecordingNotifier;
    use crate::ports::SystemClock;

    fn ledger() -> (StatusLedger, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::new());
        (
            StatusLedger::new(notifier.clone(), Arc::new(SystemClock)),
            notifier,
        )
    }

    #[tokio::test]
    async fn drops_duplicates_and_invalid_transitions() {
        let (ledger, notifier) = ledger();
        let key = TaskExecutionKey::new(1, "t", 1);

        assert!(ledger.send_task_status_change(&key, TaskStatus::Queued).await);
        assert!(!ledger.send_task_status_change(&key, TaskStatus::Queued).await);
        assert!(!ledger.send_task_status_change(&key, TaskStatus::Stopped).await);
        assert!(ledger.send_task_status_change(&key, TaskStatus::Running).await);
        assert!(ledger.send_task_status_change(&key, TaskStatus::Success).await);
        assert!(!ledger.send_task_status_change(&key, TaskStatus::Running).await);

        assert_eq!(
            notifier.statuses(&key),
            vec![TaskStatus::Queued, TaskStatus::Running, TaskStatus::Success]
        );
        assert_eq!(ledger.last_status(&key).await, Some(TaskStatus::Success));
    }

    #[tokio::test]
    async fn unseen_key_cannot_start_running() {
        let (ledger, notifier) = ledger();
        let key = TaskExecutionKey::new(1, "t", 1);
        assert!(!ledger.send_task_status_change(&key, TaskStatus::Running).await);
        assert!(notifier.events().is_empty());
    }

    #[tokio::test]
    async fn announce_emits_once_per_seq() {
        let (ledger, notifier) = ledger();
        let key = TaskExecutionKey::new(1, "t", 1);

        ledger.announce(7, &key, TaskStatus::Queued).await;
        ledger.announce_taken(7, &key, TaskStatus::Queued).await;
        ledger.send_task_status_change(&key, TaskStatus::Running).await;

        assert_eq!(
            notifier.statuses(&key),
            vec![TaskStatus::Queued, TaskStatus::Running]
        );
        assert_eq!(ledger.pending_announcements().await, 0);
    }

    #[tokio::test]
    async fn late_caller_announce_is_ignored() {
        let (ledger, notifier) = ledger();
        let key = TaskExecutionKey::new(1, "t", 1);

        ledger.announce_taken(7, &key, TaskStatus::Restarting).await;
        ledger.send_task_status_change(&key, TaskStatus::Failed).await;
        // FAILED -> RESTARTING would be a legal transition, so only the seq stops it
        ledger.announce(7, &key, TaskStatus::Restarting).await;

        assert_eq!(
            notifier.statuses(&key),
            vec![TaskStatus::Restarting, TaskStatus::Failed]
        );
        assert_eq!(ledger.pending_announcements().await, 0);
    }

    #[tokio::test]
    async fn loop_only_announcements_leave_nothing_behind() {
        let (ledger, notifier) = ledger();
        for seq in 1..=50 {
            let key = TaskExecutionKey::new(1, "t", seq as u32);
            ledger.announce_taken(seq, &key, TaskStatus::Queued).await;
        }
        assert_eq!(notifier.events().len(), 50);
        assert_eq!(ledger.pending_announcements().await, 0);
    }

    #[tokio::test]
    async fn streams_are_per_key() {
        let (ledger, notifier) = ledger();
        let a = TaskExecutionKey::new(1, "a", 1);
        let b = TaskExecutionKey::new(1, "b", 1);

        ledger.send_task_status_change(&a, TaskStatus::Queued).await;
        ledger.send_task_status_change(&b, TaskStatus::Stopping).await;
        ledger.send_task_status_change(&a, TaskStatus::Running).await;

        assert_eq!(notifier.events().len(), 3);
        assert_eq!(notifier.statuses(&b), vec![TaskStatus::Stopping]);
    }
}
