//! Bounded FIFO command queue.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use super::{CommandOrigin, QueuedCommand};
use crate::domain::{ExecutorError, TaskScheduleCommand};
use crate::ports::CommandJournal;

pub const DEFAULT_CAPACITY: usize = 100;

struct QueueState {
    entries: VecDeque<QueuedCommand>,
    closed: bool,
    next_seq: u64,
}

/// Bounded FIFO of pending schedule commands.
///
/// - `put` waits while the queue is full (backpressure); it never drops.
/// - `take` waits while the queue is empty.
/// - `close` refuses further puts, but entries already queued are still
///   handed out; `take` returns `None` only once closed and drained.
///
/// When a journal is attached every entry is appended before it becomes
/// visible to `take`, so a crash between put and processing loses nothing.
pub struct CommandQueue {
    state: Mutex<QueueState>,
    not_empty: Notify,
    not_full: Notify,
    capacity: usize,
    journal: Option<Arc<dyn CommandJournal>>,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                entries: VecDeque::with_capacity(capacity),
                closed: false,
                next_seq: 1,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            capacity: capacity.max(1),
            journal: None,
        }
    }

    pub fn with_journal(capacity: usize, journal: Arc<dyn CommandJournal>) -> Self {
        let mut queue = Self::new(capacity);
        queue.journal = Some(journal);
        queue
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Put pending entries recovered from the journal back at the front.
    ///
    /// Restored entries may exceed capacity; they were accepted once already.
    pub async fn restore(&self, mut recovered: Vec<QueuedCommand>) {
        if recovered.is_empty() {
            return;
        }
        recovered.sort_by_key(|entry| entry.seq);
        {
            let mut state = self.state.lock().await;
            let max_seq = recovered.last().map(|entry| entry.seq).unwrap_or(0);
            state.next_seq = state.next_seq.max(max_seq + 1);
            for entry in recovered.into_iter().rev() {
                state.entries.push_front(entry);
            }
            debug!(pending = state.entries.len(), "restored commands from journal");
        }
        self.not_empty.notify_one();
    }

    /// Enqueue a command, waiting while the queue is full.
    ///
    /// Returns the entry's seq.
    pub async fn put(
        &self,
        command: TaskScheduleCommand,
        origin: CommandOrigin,
    ) -> Result<u64, ExecutorError> {
        loop {
            // register interest before checking, so a take() in between is not missed
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if state.closed {
                    return Err(ExecutorError::QueueClosed);
                }
                if state.entries.len() < self.capacity {
                    let entry = QueuedCommand {
                        seq: state.next_seq,
                        command,
                        enqueued_at: Utc::now(),
                        origin,
                    };
                    if let Some(journal) = &self.journal {
                        journal
                            .append(&entry)
                            .await
                            .map_err(|e| ExecutorError::Journal(e.to_string()))?;
                    }
                    state.next_seq += 1;
                    let seq = entry.seq;
                    state.entries.push_back(entry);
                    drop(state);
                    self.not_empty.notify_one();
                    return Ok(seq);
                }
                debug!(capacity = self.capacity, "command queue full, waiting");
            }

            notified.await;
        }
    }

    /// Dequeue the oldest entry, waiting while empty.
    ///
    /// `None` means closed and fully drained.
    pub async fn take(&self) -> Option<QueuedCommand> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if let Some(entry) = state.entries.pop_front() {
                    drop(state);
                    self.not_full.notify_one();
                    return Some(entry);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark an entry as fully processed.
    pub async fn ack(&self, seq: u64) -> Result<(), ExecutorError> {
        if let Some(journal) = &self.journal {
            journal
                .ack(seq)
                .await
                .map_err(|e| ExecutorError::Journal(e.to_string()))?;
        }
        Ok(())
    }

    /// Stop accepting commands and wake every waiter. Idempotent.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }
}
