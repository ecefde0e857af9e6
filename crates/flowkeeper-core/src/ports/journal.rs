//! CommandJournal port - persistence for pending schedule commands
//!
//! Every command put on the queue is appended here and acknowledged once the
//! processing loop has finished with it. On start the executor replays
//! whatever was never acknowledged.

use async_trait::async_trait;
use thiserror::Error;

use crate::queue::QueuedCommand;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal record is corrupt: {0}")]
    Corrupt(String),

    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait CommandJournal: Send + Sync {
    async fn append(&self, entry: &QueuedCommand) -> Result<(), JournalError>;

    async fn ack(&self, seq: u64) -> Result<(), JournalError>;

    /// Unacknowledged entries in seq order.
    async fn pending(&self) -> Result<Vec<QueuedCommand>, JournalError>;
}
