//! flowkeeper-core
//!
//! Task-execution scheduling: accepts start / stop / restart commands for
//! task attempts, runs them on a pluggable backend, reports every status
//! change, and recovers attempts whose heartbeats stop.
//!
//! # モジュール構成
//! - **domain**: keys, commands, statuses, events, errors
//! - **ports**: BackendDriver, StatusNotifier, CommandJournal, Clock
//! - **queue**: bounded command queue
//! - **app**: TaskExecutorCore, processing loop, heartbeat monitor
//! - **impls**: backends (local / container / cluster), journals, notifiers
//! - **config**: ExecutorConfig (YAML)

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod queue;

pub use app::TaskExecutorCore;
pub use config::{BackendKind, ExecutorConfig, HeartbeatPolicy};
pub use domain::{
    BackendError, ExecutorError, TaskAction, TaskExecutionKey, TaskScheduleCommand, TaskStatus,
    TaskStatusEvent,
};
