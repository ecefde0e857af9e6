//! ContainerBackend - one docker container per task attempt.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::runner::{CommandRunner, Probe, spawn_watcher};
use crate::config::ContainerConfig;
use crate::domain::{BackendError, TaskExecutionKey};
use crate::ports::{BackendDriver, BackendHandle, ExecutionContext, ExecutionOutcome};

const NAME_PREFIX: &str = "flowkeeper";

pub struct ContainerBackend {
    config: ContainerConfig,
    runner: Arc<dyn CommandRunner>,
    poll_interval: Duration,
    watchers: Mutex<HashMap<TaskExecutionKey, CancellationToken>>,
}

impl ContainerBackend {
    pub fn new(
        config: ContainerConfig,
        runner: Arc<dyn CommandRunner>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            config,
            runner,
            poll_interval,
            watchers: Mutex::new(HashMap::new()),
        }
    }

    fn run_args(&self, key: &TaskExecutionKey, name: &str) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--label".to_string(),
            format!("flowkeeper.workflow_execution_id={}", key.workflow_execution_id()),
            "--label".to_string(),
            format!("flowkeeper.task_name={}", key.task_name()),
            "--label".to_string(),
            format!("flowkeeper.attempt={}", key.attempt()),
        ];
        args.extend(self.config.extra_args.iter().cloned());
        args.push(self.config.image.clone());
        args.extend(self.config.command.iter().map(|arg| key.render(arg)));
        args
    }

    fn watchers(&self) -> std::sync::MutexGuard<'_, HashMap<TaskExecutionKey, CancellationToken>> {
        self.watchers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn parse_inspect(stdout: &str) -> Probe {
    let mut parts = stdout.split_whitespace();
    let state = parts.next().unwrap_or_default();
    let exit_code = parts.next().and_then(|c| c.parse::<i32>().ok());
    match state {
        "created" | "running" | "restarting" | "paused" => Probe::Running,
        "exited" | "dead" => match exit_code {
            Some(0) => Probe::Finished(ExecutionOutcome::Success),
            code => Probe::Finished(ExecutionOutcome::Failed(format!(
                "container exited with code {}",
                code.map(|c| c.to_string()).unwrap_or_else(|| "?".into())
            ))),
        },
        other => Probe::Unknown(format!("unexpected container state {other:?}")),
    }
}

fn is_missing(stderr: &str) -> bool {
    stderr.contains("No such container") || stderr.contains("No such object")
}

#[async_trait]
impl BackendDriver for ContainerBackend {
    fn name(&self) -> &'static str {
        "container"
    }

    async fn start_task_execution(
        &self,
        key: &TaskExecutionKey,
        ctx: &ExecutionContext,
    ) -> Result<BackendHandle, BackendError> {
        let name = key.resource_name(NAME_PREFIX);
        let args = self.run_args(key, &name);
        let container_id = self
            .runner
            .run(&self.config.docker_binary, &args, None)
            .await
            .map_err(|stderr| {
                if stderr.contains("is already in use") {
                    BackendError::AlreadyRunning(key.clone())
                } else {
                    BackendError::Launch(stderr.trim().to_string())
                }
            })?;
        info!(key = %key, container = %name, image = %self.config.image, "container started");

        let token = CancellationToken::new();
        if let Some(previous) = self.watchers().insert(key.clone(), token.clone()) {
            previous.cancel();
        }
        let runner = Arc::clone(&self.runner);
        let docker = self.config.docker_binary.clone();
        let probe_name = name.clone();
        spawn_watcher(key.clone(), ctx.clone(), self.poll_interval, token, move || {
            let runner = Arc::clone(&runner);
            let docker = docker.clone();
            let name = probe_name.clone();
            async move {
                let args = vec![
                    "inspect".to_string(),
                    "-f".to_string(),
                    "{{.State.Status}} {{.State.ExitCode}}".to_string(),
                    name.clone(),
                ];
                match runner.run(&docker, &args, None).await {
                    Ok(stdout) => {
                        let probe = parse_inspect(&stdout);
                        if matches!(probe, Probe::Finished(_)) {
                            let rm = vec!["rm".to_string(), name];
                            if let Err(e) = runner.run(&docker, &rm, None).await {
                                warn!(error = %e.trim(), "failed to remove finished container");
                            }
                        }
                        probe
                    }
                    Err(stderr) if is_missing(&stderr) => Probe::Missing,
                    Err(stderr) => Probe::Unknown(stderr.trim().to_string()),
                }
            }
        });

        let container_id = container_id.trim();
        let id = if container_id.is_empty() {
            name
        } else {
            container_id.chars().take(12).collect()
        };
        Ok(BackendHandle {
            key: key.clone(),
            id,
            backend: self.name(),
            launched_at: Utc::now(),
        })
    }

    async fn stop_task_execution(&self, key: &TaskExecutionKey) -> Result<(), BackendError> {
        if let Some(token) = self.watchers().remove(key) {
            token.cancel();
        }
        let args = vec![
            "rm".to_string(),
            "-f".to_string(),
            key.resource_name(NAME_PREFIX),
        ];
        match self.runner.run(&self.config.docker_binary, &args, None).await {
            Ok(_) => Ok(()),
            Err(stderr) if is_missing(&stderr) => Ok(()),
            Err(stderr) => Err(BackendError::Unavailable(stderr.trim().to_string())),
        }
    }

    async fn shutdown(&self) {
        // containers keep running; only stop watching them
        for (_, token) in self.watchers().drain() {
            token.cancel();
        }
    }
}
