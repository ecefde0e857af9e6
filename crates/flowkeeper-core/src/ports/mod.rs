//! Ports - 抽象化レイヤー
//!
//! Each trait is a seam to something outside the scheduling core: where
//! tasks run, where status events go, where pending commands are kept, and
//! what time it is.

pub mod backend;
pub mod clock;
pub mod journal;
pub mod notifier;

pub use self::backend::{
    BackendDriver, BackendHandle, ExecutionContext, ExecutionOutcome, HeartbeatSink,
    OutcomeReport,
};
pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::journal::{CommandJournal, JournalError};
pub use self::notifier::{NotifyError, StatusNotifier};
