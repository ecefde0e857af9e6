//! LocalBackend - attempts run on this host, bounded by a parallelism semaphore.
//!
//! Two isolation modes:
//! - `Isolation::NewProcess`: one child process per attempt (templated argv)
//! - `Isolation::InProcess`: a registered `TaskHandler` runs on the tokio runtime
//!
//! Every attempt gets a supervisor task. It waits for a slot, heartbeats every
//! `heartbeat_interval`, and reports the outcome unless the attempt was stopped.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use ulid::Ulid;

use crate::domain::{BackendError, TaskExecutionKey};
use crate::ports::{BackendDriver, BackendHandle, ExecutionContext, ExecutionOutcome};

/// In-process body of a task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// `Err(reason)` marks the attempt FAILED.
    async fn run(&self, key: &TaskExecutionKey) -> Result<(), String>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("handler already registered for task {0:?}")]
    DuplicateHandler(String),
}

/// task_name -> handler, with an optional catch-all.
///
/// Filled during initialization, read-only afterwards.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    fallback: Option<Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        task_name: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), RegistryError> {
        let task_name = task_name.into();
        if self.handlers.contains_key(&task_name) {
            return Err(RegistryError::DuplicateHandler(task_name));
        }
        self.handlers.insert(task_name, handler);
        Ok(())
    }

    /// Used for task names with no handler of their own.
    pub fn set_fallback(&mut self, handler: Arc<dyn TaskHandler>) {
        self.fallback = Some(handler);
    }

    pub fn get(&self, task_name: &str) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(task_name).or(self.fallback.as_ref())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty() && self.fallback.is_none()
    }
}

pub enum Isolation {
    NewProcess { command: Vec<String> },
    InProcess { registry: Arc<HandlerRegistry> },
}

type Work = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

struct RunningAttempt {
    generation: Ulid,
    token: CancellationToken,
    join: JoinHandle<()>,
}

type RunningMap = Arc<Mutex<HashMap<TaskExecutionKey, RunningAttempt>>>;

pub struct LocalBackend {
    isolation: Isolation,
    permits: Arc<Semaphore>,
    heartbeat_interval: Duration,
    running: RunningMap,
}

impl LocalBackend {
    pub fn new(isolation: Isolation, parallelism: usize, heartbeat_interval: Duration) -> Self {
        Self {
            isolation,
            permits: Arc::new(Semaphore::new(parallelism.max(1))),
            heartbeat_interval,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Attempts currently admitted (running or waiting for a slot).
    pub fn running_count(&self) -> usize {
        lock(&self.running).len()
    }

    fn work_for(&self, key: &TaskExecutionKey) -> Result<Work, BackendError> {
        match &self.isolation {
            Isolation::NewProcess { command } => {
                let argv: Vec<String> = command.iter().map(|arg| key.render(arg)).collect();
                let (program, args) = argv
                    .split_first()
                    .ok_or_else(|| BackendError::Launch("empty local task command".into()))?;
                let mut cmd = Command::new(program);
                cmd.args(args)
                    .env("FLOWKEEPER_WORKFLOW_EXECUTION_ID", key.workflow_execution_id().to_string())
                    .env("FLOWKEEPER_TASK_NAME", key.task_name())
                    .env("FLOWKEEPER_ATTEMPT", key.attempt().to_string())
                    .stdin(Stdio::null())
                    .kill_on_drop(true);
                Ok(Box::pin(async move {
                    let status = cmd
                        .status()
                        .await
                        .map_err(|e| format!("failed to spawn process: {e}"))?;
                    if status.success() {
                        Ok(())
                    } else {
                        Err(format!("process exited with {status}"))
                    }
                }))
            }
            Isolation::InProcess { registry } => {
                let handler = registry.get(key.task_name()).cloned().ok_or_else(|| {
                    BackendError::Launch(format!(
                        "no handler registered for task {:?}",
                        key.task_name()
                    ))
                })?;
                let key = key.clone();
                Ok(Box::pin(async move {
                    let mut guard = AbortOnDrop(tokio::spawn(async move { handler.run(&key).await }));
                    match (&mut guard.0).await {
                        Ok(result) => result,
                        Err(e) if e.is_panic() => Err("task handler panicked".to_string()),
                        Err(e) => Err(e.to_string()),
                    }
                }))
            }
        }
    }
}

struct AbortOnDrop(JoinHandle<Result<(), String>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn lock(running: &RunningMap) -> std::sync::MutexGuard<'_, HashMap<TaskExecutionKey, RunningAttempt>> {
    running.lock().unwrap_or_else(|e| e.into_inner())
}

struct Supervisor {
    key: TaskExecutionKey,
    generation: Ulid,
    ctx: ExecutionContext,
    token: CancellationToken,
    permits: Arc<Semaphore>,
    heartbeat_interval: Duration,
    running: RunningMap,
}

impl Supervisor {
    async fn run(self, work: Work) {
        let mut ticker = tokio::time::interval(self.heartbeat_interval);

        let acquire = Arc::clone(&self.permits).acquire_owned();
        tokio::pin!(acquire);
        let _permit = loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return,
                permit = &mut acquire => match permit {
                    Ok(permit) => break permit,
                    Err(_) => return,
                },
                _ = ticker.tick() => self.ctx.heartbeat(&self.key),
            }
        };
        debug!(key = %self.key, "local attempt got a slot");

        tokio::pin!(work);
        let result = loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return,
                result = &mut work => break result,
                _ = ticker.tick() => self.ctx.heartbeat(&self.key),
            }
        };

        {
            let mut running = lock(&self.running);
            match running.get(&self.key) {
                Some(entry) if entry.generation == self.generation => {
                    running.remove(&self.key);
                }
                // stopped (and maybe restarted under the same key) meanwhile
                _ => return,
            }
        }

        let outcome = match result {
            Ok(()) => ExecutionOutcome::Success,
            Err(reason) => ExecutionOutcome::Failed(reason),
        };
        info!(key = %self.key, ?outcome, "local attempt finished");
        self.ctx.report_outcome(self.key, outcome);
    }
}

#[async_trait]
impl BackendDriver for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn start_task_execution(
        &self,
        key: &TaskExecutionKey,
        ctx: &ExecutionContext,
    ) -> Result<BackendHandle, BackendError> {
        let mut running = lock(&self.running);
        if running.contains_key(key) {
            return Err(BackendError::AlreadyRunning(key.clone()));
        }
        let work = self.work_for(key)?;

        let generation = Ulid::new();
        let token = CancellationToken::new();
        let supervisor = Supervisor {
            key: key.clone(),
            generation,
            ctx: ctx.clone(),
            token: token.clone(),
            permits: Arc::clone(&self.permits),
            heartbeat_interval: self.heartbeat_interval,
            running: Arc::clone(&self.running),
        };
        let join = tokio::spawn(supervisor.run(work));
        running.insert(
            key.clone(),
            RunningAttempt {
                generation,
                token,
                join,
            },
        );
        info!(key = %key, %generation, "local attempt admitted");

        Ok(BackendHandle {
            key: key.clone(),
            id: generation.to_string(),
            backend: self.name(),
            launched_at: Utc::now(),
        })
    }

    async fn stop_task_execution(&self, key: &TaskExecutionKey) -> Result<(), BackendError> {
        let Some(attempt) = lock(&self.running).remove(key) else {
            return Ok(());
        };
        attempt.token.cancel();
        if let Err(e) = attempt.join.await {
            debug!(key = %key, error = %e, "supervisor ended abnormally");
        }
        info!(key = %key, "local attempt stopped");
        Ok(())
    }

    async fn shutdown(&self) {
        let attempts: Vec<_> = lock(&self.running).drain().collect();
        for (_, attempt) in &attempts {
            attempt.token.cancel();
        }
        for (key, attempt) in attempts {
            if let Err(e) = attempt.join.await {
                debug!(key = %key, error = %e, "supervisor ended abnormally");
            }
        }
    }
}
