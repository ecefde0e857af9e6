//! ClusterBackend - one Kubernetes Job per task attempt, driven through kubectl.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::runner::{CommandRunner, Probe, spawn_watcher};
use crate::config::ClusterConfig;
use crate::domain::{BackendError, TaskExecutionKey};
use crate::ports::{BackendDriver, BackendHandle, ExecutionContext, ExecutionOutcome};

const NAME_PREFIX: &str = "flowkeeper";

pub struct ClusterBackend {
    config: ClusterConfig,
    runner: Arc<dyn CommandRunner>,
    poll_interval: Duration,
    watchers: Mutex<HashMap<TaskExecutionKey, CancellationToken>>,
}

impl ClusterBackend {
    pub fn new(config: ClusterConfig, runner: Arc<dyn CommandRunner>, poll_interval: Duration) -> Self {
        Self {
            config,
            runner,
            poll_interval,
            watchers: Mutex::new(HashMap::new()),
        }
    }

    /// Job manifest for one attempt, built on top of the configured template.
    pub fn render_job(&self, key: &TaskExecutionKey) -> Result<Value, BackendError> {
        let mut job = self.config.job_template.clone();
        let name = key.resource_name(NAME_PREFIX);
        let labels = json!({
            "app.kubernetes.io/managed-by": "flowkeeper",
            "flowkeeper/workflow-execution-id": key.workflow_execution_id().to_string(),
            "flowkeeper/task-name": key.task_name(),
            "flowkeeper/attempt": key.attempt().to_string(),
        });

        let root = job
            .as_object_mut()
            .ok_or_else(|| BackendError::Launch("job template must be a mapping".into()))?;
        let metadata = root
            .entry("metadata")
            .or_insert_with(|| json!({}))
            .as_object_mut()
            .ok_or_else(|| BackendError::Launch("job template metadata must be a mapping".into()))?;
        metadata.insert("name".into(), json!(name));
        metadata.insert("namespace".into(), json!(self.config.namespace));
        metadata.insert("labels".into(), labels);

        let container = job
            .pointer_mut("/spec/template/spec/containers/0")
            .and_then(Value::as_object_mut)
            .ok_or_else(|| {
                BackendError::Launch("job template needs spec.template.spec.containers[0]".into())
            })?;
        container
            .entry("name")
            .or_insert_with(|| json!("task"));
        container.insert("image".into(), json!(self.config.image));
        if !self.config.command.is_empty() {
            let command: Vec<String> = self.config.command.iter().map(|arg| key.render(arg)).collect();
            container.insert("command".into(), json!(command));
        }
        Ok(job)
    }

    fn kubectl_args(&self, verb: &[&str]) -> Vec<String> {
        let mut args: Vec<String> = verb.iter().map(|s| s.to_string()).collect();
        args.push("-n".to_string());
        args.push(self.config.namespace.clone());
        args
    }

    fn watchers(&self) -> std::sync::MutexGuard<'_, HashMap<TaskExecutionKey, CancellationToken>> {
        self.watchers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Job status as `active/succeeded/failed/conditions`, where conditions are
/// the types of the conditions currently true.
const JOB_STATUS_JSONPATH: &str = "jsonpath={.status.active}/{.status.succeeded}/{.status.failed}/\
{.status.conditions[?(@.status==\"True\")].type}";

/// Only the `Complete` and `Failed` conditions end a Job. Failed pods alone
/// do not: the Job retries them up to its `backoffLimit`.
fn parse_job_status(stdout: &str) -> Probe {
    let fields: Vec<&str> = stdout.trim().split('/').map(str::trim).collect();
    let [_, _, failed, conditions] = fields.as_slice() else {
        return Probe::Unknown(format!("unexpected job status {stdout:?}"));
    };
    let mut conditions = conditions.split_whitespace();
    if conditions.clone().any(|c| c == "Complete") {
        return Probe::Finished(ExecutionOutcome::Success);
    }
    if conditions.any(|c| c == "Failed") {
        let failed: u32 = failed.parse().unwrap_or(0);
        return Probe::Finished(ExecutionOutcome::Failed(format!(
            "job failed after {failed} failed pod(s)"
        )));
    }
    Probe::Running
}

fn is_not_found(stderr: &str) -> bool {
    stderr.contains("NotFound") || stderr.contains("not found")
}

#[async_trait]
impl BackendDriver for ClusterBackend {
    fn name(&self) -> &'static str {
        "cluster"
    }

    async fn start_task_execution(
        &self,
        key: &TaskExecutionKey,
        ctx: &ExecutionContext,
    ) -> Result<BackendHandle, BackendError> {
        let manifest = self.render_job(key)?;
        let manifest = serde_json::to_string(&manifest)
            .map_err(|e| BackendError::Launch(format!("job manifest: {e}")))?;
        let name = key.resource_name(NAME_PREFIX);

        self.runner
            .run(
                &self.config.kubectl_binary,
                &self.kubectl_args(&["create", "-f", "-"]),
                Some(&manifest),
            )
            .await
            .map_err(|stderr| {
                if stderr.contains("AlreadyExists") || stderr.contains("already exists") {
                    BackendError::AlreadyRunning(key.clone())
                } else {
                    BackendError::Launch(stderr.trim().to_string())
                }
            })?;
        info!(key = %key, job = %name, namespace = %self.config.namespace, "job created");

        let token = CancellationToken::new();
        if let Some(previous) = self.watchers().insert(key.clone(), token.clone()) {
            previous.cancel();
        }
        let runner = Arc::clone(&self.runner);
        let kubectl = self.config.kubectl_binary.clone();
        let args = self.kubectl_args(&[
            "get",
            "job",
            &name,
            "-o",
            JOB_STATUS_JSONPATH,
        ]);
        spawn_watcher(key.clone(), ctx.clone(), self.poll_interval, token, move || {
            let runner = Arc::clone(&runner);
            let kubectl = kubectl.clone();
            let args = args.clone();
            async move {
                match runner.run(&kubectl, &args, None).await {
                    Ok(stdout) => parse_job_status(&stdout),
                    Err(stderr) if is_not_found(&stderr) => Probe::Missing,
                    Err(stderr) => Probe::Unknown(stderr.trim().to_string()),
                }
            }
        });

        Ok(BackendHandle {
            key: key.clone(),
            id: name,
            backend: self.name(),
            launched_at: Utc::now(),
        })
    }

    async fn stop_task_execution(&self, key: &TaskExecutionKey) -> Result<(), BackendError> {
        if let Some(token) = self.watchers().remove(key) {
            token.cancel();
        }
        let name = key.resource_name(NAME_PREFIX);
        let args = self.kubectl_args(&[
            "delete",
            "job",
            &name,
            "--ignore-not-found",
            "--cascade=foreground",
        ]);
        self.runner
            .run(&self.config.kubectl_binary, &args, None)
            .await
            .map(|_| ())
            .map_err(|stderr| BackendError::Unavailable(stderr.trim().to_string()))
    }

    async fn shutdown(&self) {
        for (_, token) in self.watchers().drain() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::runner::testing::RecordingRunner;

    fn backend(runner: Arc<RecordingRunner>) -> ClusterBackend {
        let config = ClusterConfig {
            namespace: "flows".into(),
            image: "runner:2".into(),
            command: vec!["run-task".into(), "--attempt={attempt}".into()],
            ..ClusterConfig::default()
        };
        ClusterBackend::new(config, runner, Duration::from_secs(3600))
    }

    #[test]
    fn job_manifest_is_filled_per_attempt() {
        let backend = backend(Arc::new(RecordingRunner::default()));
        let job = backend.render_job(&TaskExecutionKey::new(4, "Score", 3)).unwrap();

        assert_eq!(job["kind"], "Job");
        assert_eq!(job["metadata"]["name"], "flowkeeper-score-26f8470e-4-3");
        assert_eq!(job["metadata"]["namespace"], "flows");
        assert_eq!(job["metadata"]["labels"]["flowkeeper/attempt"], "3");
        let container = &job["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["image"], "runner:2");
        assert_eq!(container["command"], json!(["run-task", "--attempt=3"]));
        assert_eq!(job["spec"]["template"]["spec"]["restartPolicy"], "Never");
    }

    #[test]
    fn template_without_container_is_rejected() {
        let mut config = ClusterConfig::default();
        config.job_template = json!({"kind": "Job", "spec": {}});
        let backend = ClusterBackend::new(
            config,
            Arc::new(RecordingRunner::default()),
            Duration::from_secs(1),
        );
        assert!(matches!(
            backend.render_job(&TaskExecutionKey::new(1, "t", 1)),
            Err(BackendError::Launch(_))
        ));
    }

    #[tokio::test]
    async fn start_creates_job_from_stdin() {
        let runner = Arc::new(RecordingRunner::with_replies(vec![Ok(
            "job.batch/flowkeeper-t-2961ebef-1-1 created".into(),
        )]));
        let backend = backend(runner.clone());
        let key = TaskExecutionKey::new(1, "t", 1);

        let handle = backend
            .start_task_execution(&key, &ExecutionContext::detached())
            .await
            .unwrap();
        assert_eq!(handle.id, "flowkeeper-t-2961ebef-1-1");

        let (program, args, stdin) = runner.calls()[0].clone();
        assert_eq!(program, "kubectl");
        assert_eq!(args, vec!["create", "-f", "-", "-n", "flows"]);
        let manifest: Value = serde_json::from_str(&stdin.unwrap()).unwrap();
        assert_eq!(manifest["metadata"]["name"], "flowkeeper-t-2961ebef-1-1");
        backend.shutdown().await;
    }

    #[tokio::test]
    async fn existing_job_is_already_running() {
        let runner = Arc::new(RecordingRunner::with_replies(vec![Err(
            "Error from server (AlreadyExists): jobs.batch \"flowkeeper-t-2961ebef-1-1\" already exists".into(),
        )]));
        let backend = backend(runner);
        let key = TaskExecutionKey::new(1, "t", 1);
        let err = backend
            .start_task_execution(&key, &ExecutionContext::detached())
            .await
            .unwrap_err();
        assert_eq!(err, BackendError::AlreadyRunning(key));
    }

    #[tokio::test]
    async fn stop_ignores_missing_jobs() {
        let runner = Arc::new(RecordingRunner::default());
        let backend = backend(runner.clone());
        backend
            .stop_task_execution(&TaskExecutionKey::new(1, "t", 1))
            .await
            .unwrap();
        assert!(runner.calls()[0].1.contains(&"--ignore-not-found".to_string()));
    }

    #[test]
    fn job_status_is_parsed() {
        assert_eq!(parse_job_status("1///"), Probe::Running);
        assert_eq!(
            parse_job_status("/1//Complete"),
            Probe::Finished(ExecutionOutcome::Success)
        );
        assert!(matches!(
            parse_job_status("//3/Failed"),
            Probe::Finished(ExecutionOutcome::Failed(_))
        ));
        assert!(matches!(parse_job_status("garbage"), Probe::Unknown(_)));
    }

    #[test]
    fn failed_pods_under_backoff_keep_the_job_running() {
        // a pod failed and the Job is retrying it
        assert_eq!(parse_job_status("1//1/"), Probe::Running);
        assert_eq!(parse_job_status("//2/"), Probe::Running);
        // a suspended or partially complete Job has other true conditions
        assert_eq!(parse_job_status("1/1/1/Suspended"), Probe::Running);
        assert_eq!(
            parse_job_status("/1/2/SuccessCriteriaMet Complete"),
            Probe::Finished(ExecutionOutcome::Success)
        );
    }
}
