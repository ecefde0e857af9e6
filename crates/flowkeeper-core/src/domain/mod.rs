//! Domain model: keys, commands, statuses, events, errors.

pub mod command;
pub mod errors;
pub mod events;
pub mod key;
pub mod status;

pub use self::command::{TaskAction, TaskScheduleCommand};
pub use self::errors::{BackendError, ExecutorError};
pub use self::events::TaskStatusEvent;
pub use self::key::TaskExecutionKey;
pub use self::status::TaskStatus;
