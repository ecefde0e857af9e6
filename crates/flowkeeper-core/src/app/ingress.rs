//! CommandIngress - validate, enqueue, announce.
//!
//! External callers and the heartbeat monitor submit through the same
//! ingress, so synthetic recovery commands follow the ordinary path.

use std::sync::Arc;

use tracing::debug;

use super::ledger::StatusLedger;
use crate::domain::{ExecutorError, TaskScheduleCommand};
use crate::queue::{CommandOrigin, CommandQueue};

pub struct CommandIngress {
    queue: Arc<CommandQueue>,
    ledger: Arc<StatusLedger>,
}

impl CommandIngress {
    pub fn new(queue: Arc<CommandQueue>, ledger: Arc<StatusLedger>) -> Self {
        Self { queue, ledger }
    }

    /// Returns the queue seq of the accepted command.
    pub async fn submit(
        &self,
        command: TaskScheduleCommand,
        origin: CommandOrigin,
    ) -> Result<u64, ExecutorError> {
        command.validate()?;
        let key = command.current_task_execution.clone();
        let status = command.action.provisional_status();

        let seq = self.queue.put(command, origin).await?;
        debug!(key = %key, seq, ?origin, "command enqueued");
        self.ledger.announce(seq, &key, status).await;
        Ok(seq)
    }

    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.queue
    }
}
