//! Executor configuration.
//!
//! Field names on the wire follow the server config file
//! (`task_executor`, `local_executor_parallelism`, ...). Durations are whole
//! seconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::queue::DEFAULT_CAPACITY;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Which backend runs task executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Local,
    Container,
    #[serde(alias = "kubernetes", alias = "k8s")]
    Cluster,
}

/// What the heartbeat monitor asks for when an attempt is dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatPolicy {
    /// RESTART into the next attempt.
    Restart,
    /// STOP; the dead attempt ends as FAILED.
    Stop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    #[serde(rename = "task_executor")]
    pub backend: BackendKind,

    #[serde(rename = "local_executor_parallelism")]
    pub parallelism: usize,

    #[serde(rename = "task_executor_heartbeat_check_interval", with = "secs")]
    pub heartbeat_check_interval: Duration,

    #[serde(rename = "task_heartbeat_timeout", with = "secs")]
    pub heartbeat_timeout: Duration,

    #[serde(rename = "task_heartbeat_interval", with = "secs")]
    pub heartbeat_interval: Duration,

    /// Local backend isolation: child process per attempt when true,
    /// in-process handler when false.
    pub execute_tasks_in_new_interpreter: bool,

    pub command_queue_capacity: usize,

    /// Upper bound for a single backend start/stop call.
    #[serde(with = "secs")]
    pub backend_timeout: Duration,

    pub heartbeat_policy: HeartbeatPolicy,

    /// Persist pending commands here. In-memory when unset.
    pub command_journal_path: Option<PathBuf>,

    /// argv for a local child process; see `TaskExecutionKey::render`.
    pub local_task_command: Vec<String>,

    pub container: ContainerConfig,

    #[serde(rename = "k8s_executor_config")]
    pub cluster: ClusterConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Local,
            parallelism: 10,
            heartbeat_check_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(10),
            execute_tasks_in_new_interpreter: false,
            command_queue_capacity: DEFAULT_CAPACITY,
            backend_timeout: Duration::from_secs(30),
            heartbeat_policy: HeartbeatPolicy::Restart,
            command_journal_path: None,
            local_task_command: Vec::new(),
            container: ContainerConfig::default(),
            cluster: ClusterConfig::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parallelism == 0 {
            return Err(ConfigError::Invalid(
                "local_executor_parallelism must be at least 1".into(),
            ));
        }
        if self.command_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "command_queue_capacity must be at least 1".into(),
            ));
        }
        if self.heartbeat_check_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "task_executor_heartbeat_check_interval must be positive".into(),
            ));
        }
        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(ConfigError::Invalid(format!(
                "task_heartbeat_timeout ({:?}) must exceed task_heartbeat_interval ({:?})",
                self.heartbeat_timeout, self.heartbeat_interval
            )));
        }
        if self.backend_timeout.is_zero() {
            return Err(ConfigError::Invalid("backend_timeout must be positive".into()));
        }
        if self.backend == BackendKind::Local
            && self.execute_tasks_in_new_interpreter
            && self.local_task_command.is_empty()
        {
            return Err(ConfigError::Invalid(
                "local_task_command is required when execute_tasks_in_new_interpreter is set"
                    .into(),
            ));
        }
        Ok(())
    }
}

/// Docker backend settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub image: String,
    pub docker_binary: String,
    /// Passed to `docker run` before the image.
    pub extra_args: Vec<String>,
    /// Command run inside the container (templated).
    pub command: Vec<String>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: "alpine:latest".to_string(),
            docker_binary: "docker".to_string(),
            extra_args: Vec::new(),
            command: Vec::new(),
        }
    }
}

/// Kubernetes Job backend settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub namespace: String,
    pub kubectl_binary: String,
    pub image: String,
    /// Command run in the job's container (templated).
    pub command: Vec<String>,
    /// Base Job manifest. Name, labels, image and command are filled in per attempt.
    pub job_template: serde_json::Value,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            kubectl_binary: "kubectl".to_string(),
            image: "alpine:latest".to_string(),
            command: Vec::new(),
            job_template: serde_json::json!({
                "apiVersion": "batch/v1",
                "kind": "Job",
                "spec": {
                    "backoffLimit": 0,
                    "template": {
                        "spec": {
                            "restartPolicy": "Never",
                            "containers": [{ "name": "task" }]
                        }
                    }
                }
            }),
        }
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
