//! App - アプリケーション層
//!
//! ports を組み合わせて executor を組み立てる。
//!
//! # 主要コンポーネント
//! - **TaskExecutorCore**: lifecycle and command ingress
//! - **CommandProcessor**: the command-processing loop
//! - **StatusLedger**: single emission path for status changes
//! - **HeartbeatMonitor**: ALIVE / SUSPECT / DEAD tracking and recovery

pub mod executor;
pub mod heartbeat;
pub mod ingress;
pub mod ledger;
pub mod processor;

// 主要な型を再エクスポート
pub use self::executor::TaskExecutorCore;
pub use self::heartbeat::{HeartbeatMonitor, HeartbeatTable, Liveness};
pub use self::ingress::CommandIngress;
pub use self::ledger::StatusLedger;
pub use self::processor::LiveExecutions;
