//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **LocalBackend / ContainerBackend / ClusterBackend**: BackendDriver
//! - **InMemoryCommandJournal / FileCommandJournal**: CommandJournal
//! - **TracingNotifier / ChannelNotifier / RecordingNotifier**: StatusNotifier
//!
//! `build_backend` picks the backend named in the configuration.

pub mod cluster;
pub mod container;
pub mod journal;
pub mod local;
pub mod notifiers;
pub mod runner;

use std::sync::Arc;

pub use self::cluster::ClusterBackend;
pub use self::container::ContainerBackend;
pub use self::journal::{FileCommandJournal, InMemoryCommandJournal};
pub use self::local::{HandlerRegistry, Isolation, LocalBackend, RegistryError, TaskHandler};
pub use self::notifiers::{ChannelNotifier, RecordingNotifier, TracingNotifier};
pub use self::runner::{CommandRunner, ProcessRunner};

use crate::config::{BackendKind, ExecutorConfig};
use crate::ports::BackendDriver;

/// Backend selected by `config.backend`.
///
/// `registry` only matters for the local backend running in-process.
pub fn build_backend(
    config: &ExecutorConfig,
    registry: Arc<HandlerRegistry>,
) -> Arc<dyn BackendDriver> {
    match config.backend {
        BackendKind::Local => {
            let isolation = if config.execute_tasks_in_new_interpreter {
                Isolation::NewProcess {
                    command: config.local_task_command.clone(),
                }
            } else {
                Isolation::InProcess { registry }
            };
            Arc::new(LocalBackend::new(
                isolation,
                config.parallelism,
                config.heartbeat_interval,
            ))
        }
        BackendKind::Container => Arc::new(ContainerBackend::new(
            config.container.clone(),
            Arc::new(ProcessRunner),
            config.heartbeat_interval,
        )),
        BackendKind::Cluster => Arc::new(ClusterBackend::new(
            config.cluster.clone(),
            Arc::new(ProcessRunner),
            config.heartbeat_interval,
        )),
    }
}
