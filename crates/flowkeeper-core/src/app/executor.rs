//! TaskExecutorCore - lifecycle, command ingress and wiring.
//!
//! # 設計原則
//! - one processing loop per executor; the live map has that loop as its only writer
//! - every status change goes through `StatusLedger`
//! - heartbeat recovery goes through the same ingress as external commands
//! - `stop()` drains: commands already accepted are still processed

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::heartbeat::{HeartbeatMonitor, HeartbeatTable, Liveness};
use super::ingress::CommandIngress;
use super::ledger::StatusLedger;
use super::processor::{CommandProcessor, LiveExecutions};
use crate::config::ExecutorConfig;
use crate::domain::{ExecutorError, TaskExecutionKey, TaskScheduleCommand, TaskStatus};
use crate::impls::{FileCommandJournal, HandlerRegistry, InMemoryCommandJournal, build_backend};
use crate::ports::{
    BackendDriver, Clock, CommandJournal, ExecutionContext, HeartbeatSink, StatusNotifier,
    SystemClock,
};
use crate::queue::{CommandOrigin, CommandQueue};

const START_FIRST: &str = "start() has not been called";
const ALREADY_STARTED: &str = "start() was already called";

struct Started {
    ingress: Arc<CommandIngress>,
    monitor: Arc<HeartbeatMonitor>,
    processor_task: JoinHandle<()>,
    monitor_task: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

enum Lifecycle {
    Idle,
    Started(Started),
    Stopped,
}

pub struct TaskExecutorCore {
    config: ExecutorConfig,
    backend: Arc<dyn BackendDriver>,
    notifier: Arc<dyn StatusNotifier>,
    clock: Arc<dyn Clock>,
    journal: Arc<dyn CommandJournal>,
    ledger: Arc<StatusLedger>,
    heartbeats: Arc<HeartbeatTable>,
    live: LiveExecutions,
    lifecycle: Mutex<Lifecycle>,
}

impl TaskExecutorCore {
    pub fn new(
        config: ExecutorConfig,
        backend: Arc<dyn BackendDriver>,
        notifier: Arc<dyn StatusNotifier>,
    ) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            config,
            backend,
            ledger: Arc::new(StatusLedger::new(Arc::clone(&notifier), Arc::clone(&clock))),
            heartbeats: Arc::new(HeartbeatTable::new(Arc::clone(&clock))),
            notifier,
            clock,
            journal: Arc::new(InMemoryCommandJournal::new()),
            live: Arc::new(RwLock::new(HashMap::new())),
            lifecycle: Mutex::new(Lifecycle::Idle),
        }
    }

    /// Backend and journal as named by the configuration.
    pub fn from_config(
        config: ExecutorConfig,
        registry: Arc<HandlerRegistry>,
        notifier: Arc<dyn StatusNotifier>,
    ) -> Result<Self, ExecutorError> {
        let backend = build_backend(&config, registry);
        let journal: Option<Arc<dyn CommandJournal>> = match &config.command_journal_path {
            Some(path) => Some(Arc::new(
                FileCommandJournal::open(path).map_err(|e| ExecutorError::Journal(e.to_string()))?,
            )),
            None => None,
        };
        let core = Self::new(config, backend, notifier);
        Ok(match journal {
            Some(journal) => core.with_journal(journal),
            None => core,
        })
    }

    /// Replace the clock. Call before `start()`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.ledger = Arc::new(StatusLedger::new(Arc::clone(&self.notifier), Arc::clone(&clock)));
        self.heartbeats = Arc::new(HeartbeatTable::new(Arc::clone(&clock)));
        self.clock = clock;
        self
    }

    pub fn with_journal(mut self, journal: Arc<dyn CommandJournal>) -> Self {
        self.journal = journal;
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Replay the journal, then spawn the processing loop and the heartbeat monitor.
    pub async fn start(&self) -> Result<(), ExecutorError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if !matches!(*lifecycle, Lifecycle::Idle) {
            return Err(ExecutorError::NotStarted(ALREADY_STARTED));
        }

        let queue = Arc::new(CommandQueue::with_journal(
            self.config.command_queue_capacity,
            Arc::clone(&self.journal),
        ));
        let pending = self
            .journal
            .pending()
            .await
            .map_err(|e| ExecutorError::Journal(e.to_string()))?;
        if !pending.is_empty() {
            info!(count = pending.len(), "replaying unprocessed commands");
        }
        queue.restore(pending).await;

        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let heartbeats: Arc<dyn HeartbeatSink> = self.heartbeats.clone();
        let processor = CommandProcessor {
            queue: Arc::clone(&queue),
            backend: Arc::clone(&self.backend),
            ledger: Arc::clone(&self.ledger),
            live: Arc::clone(&self.live),
            heartbeats: Arc::clone(&self.heartbeats),
            ctx: ExecutionContext::new(outcome_tx, heartbeats),
            outcomes: outcome_rx,
            backend_timeout: self.config.backend_timeout,
        };
        let processor_task = tokio::spawn(processor.run());

        let ingress = Arc::new(CommandIngress::new(queue, Arc::clone(&self.ledger)));
        let monitor = Arc::new(HeartbeatMonitor::new(
            &self.config,
            Arc::clone(&self.heartbeats),
            Arc::clone(&self.live),
            Arc::clone(&ingress),
            Arc::clone(&self.clock),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let monitor_task = tokio::spawn(Arc::clone(&monitor).run(shutdown_rx));

        *lifecycle = Lifecycle::Started(Started {
            ingress,
            monitor,
            processor_task,
            monitor_task,
            shutdown_tx,
        });
        info!(
            backend = self.backend.name(),
            capacity = self.config.command_queue_capacity,
            "task executor started"
        );
        Ok(())
    }

    /// Validate, enqueue, and announce the provisional status.
    ///
    /// Waits while the command queue is full.
    pub async fn schedule_task(&self, command: TaskScheduleCommand) -> Result<(), ExecutorError> {
        let ingress = self.ingress().await?;
        ingress.submit(command, CommandOrigin::External).await?;
        Ok(())
    }

    /// Liveness signal from a running attempt.
    pub fn record_heartbeat(&self, key: &TaskExecutionKey) {
        self.heartbeats.beat(key);
    }

    /// Run one heartbeat check now instead of waiting for the next interval.
    pub async fn check_heartbeats(&self) -> Result<Vec<TaskExecutionKey>, ExecutorError> {
        let monitor = match &*self.lifecycle.lock().await {
            Lifecycle::Started(started) => Arc::clone(&started.monitor),
            Lifecycle::Idle => return Err(ExecutorError::NotStarted(START_FIRST)),
            Lifecycle::Stopped => return Err(ExecutorError::QueueClosed),
        };
        Ok(monitor.check_once().await)
    }

    /// Close the queue, process what is left, then release the backend.
    ///
    /// Stopping twice is a no-op.
    pub async fn stop(&self) -> Result<(), ExecutorError> {
        let started = {
            let mut lifecycle = self.lifecycle.lock().await;
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Started(started) => started,
                Lifecycle::Idle => {
                    *lifecycle = Lifecycle::Idle;
                    return Err(ExecutorError::NotStarted(START_FIRST));
                }
                Lifecycle::Stopped => return Ok(()),
            }
        };

        info!("stopping task executor, draining queued commands");
        started.ingress.queue().close().await;
        let drained = started.processor_task.await;

        // ignore send error: the monitor may already be gone
        let _ = started.shutdown_tx.send(true);
        let monitored = started.monitor_task.await;

        self.backend.shutdown().await;
        info!("task executor stopped");

        drained.map_err(|e| ExecutorError::Join(e.to_string()))?;
        monitored.map_err(|e| ExecutorError::Join(e.to_string()))?;
        Ok(())
    }

    pub async fn last_status(&self, key: &TaskExecutionKey) -> Option<TaskStatus> {
        self.ledger.last_status(key).await
    }

    /// Keys of attempts currently running on the backend.
    pub async fn live_executions(&self) -> Vec<TaskExecutionKey> {
        let mut keys: Vec<_> = self.live.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn liveness(&self, key: &TaskExecutionKey) -> Option<Liveness> {
        self.heartbeats.liveness(key)
    }

    async fn ingress(&self) -> Result<Arc<CommandIngress>, ExecutorError> {
        match &*self.lifecycle.lock().await {
            Lifecycle::Started(started) => Ok(Arc::clone(&started.ingress)),
            Lifecycle::Idle => Err(ExecutorError::NotStarted(START_FIRST)),
            Lifecycle::Stopped => {
                warn!("command rejected, executor is stopped");
                Err(ExecutorError::QueueClosed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::config::HeartbeatPolicy;
    use crate::domain::BackendError;
    use crate::impls::RecordingNotifier;
    use crate::ports::{BackendHandle, ExecutionOutcome, ManualClock};
    use crate::queue::QueuedCommand;

    const WAIT: Duration = Duration::from_secs(5);

    /// Backend that runs nothing. Task names listed in `fail` refuse to
    /// start, names in `hang` never answer, names in `unstoppable` refuse to
    /// stop.
    #[derive(Default)]
    struct FakeBackend {
        fail: HashSet<String>,
        hang: HashSet<String>,
        unstoppable: HashSet<String>,
        running: StdMutex<HashMap<TaskExecutionKey, ExecutionContext>>,
        stopped: StdMutex<Vec<TaskExecutionKey>>,
        shut_down: AtomicBool,
    }

    impl FakeBackend {
        fn failing(names: &[&str]) -> Self {
            Self {
                fail: names.iter().map(|n| n.to_string()).collect(),
                ..Self::default()
            }
        }

        fn hanging(names: &[&str]) -> Self {
            Self {
                hang: names.iter().map(|n| n.to_string()).collect(),
                ..Self::default()
            }
        }

        fn unstoppable(names: &[&str]) -> Self {
            Self {
                unstoppable: names.iter().map(|n| n.to_string()).collect(),
                ..Self::default()
            }
        }

        fn finish(&self, key: &TaskExecutionKey, outcome: ExecutionOutcome) {
            let ctx = self.running.lock().unwrap().remove(key).expect("attempt running");
            ctx.report_outcome(key.clone(), outcome);
        }
    }

    #[async_trait]
    impl BackendDriver for FakeBackend {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn start_task_execution(
            &self,
            key: &TaskExecutionKey,
            ctx: &ExecutionContext,
        ) -> Result<BackendHandle, BackendError> {
            if self.hang.contains(key.task_name()) {
                std::future::pending::<()>().await;
            }
            if self.fail.contains(key.task_name()) {
                return Err(BackendError::Launch("no capacity".into()));
            }
            let mut running = self.running.lock().unwrap();
            if running.contains_key(key) {
                return Err(BackendError::AlreadyRunning(key.clone()));
            }
            running.insert(key.clone(), ctx.clone());
            Ok(BackendHandle {
                key: key.clone(),
                id: format!("fake-{key}"),
                backend: "fake",
                launched_at: Utc::now(),
            })
        }

        async fn stop_task_execution(&self, key: &TaskExecutionKey) -> Result<(), BackendError> {
            if self.unstoppable.contains(key.task_name()) {
                return Err(BackendError::Unavailable("stop refused".into()));
            }
            self.running.lock().unwrap().remove(key);
            self.stopped.lock().unwrap().push(key.clone());
            Ok(())
        }

        async fn shutdown(&self) {
            self.shut_down.store(true, Ordering::SeqCst);
        }
    }

    fn config() -> ExecutorConfig {
        ExecutorConfig {
            // tests drive heartbeat checks by hand
            heartbeat_check_interval: Duration::from_secs(3600),
            backend_timeout: Duration::from_secs(2),
            ..ExecutorConfig::default()
        }
    }

    fn executor(backend: Arc<FakeBackend>) -> (TaskExecutorCore, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::new());
        (
            TaskExecutorCore::new(config(), backend, notifier.clone()),
            notifier,
        )
    }

    fn key(task: &str, attempt: u32) -> TaskExecutionKey {
        TaskExecutionKey::new(1, task, attempt)
    }

    #[tokio::test]
    async fn schedule_before_start_is_rejected() {
        let backend = Arc::new(FakeBackend::default());
        let (executor, notifier) = executor(backend.clone());

        let result = executor
            .schedule_task(TaskScheduleCommand::start(key("t", 1)))
            .await;
        assert!(matches!(result, Err(ExecutorError::NotStarted(_))));
        assert!(matches!(executor.stop().await, Err(ExecutorError::NotStarted(_))));
        assert!(notifier.events().is_empty());

        // nothing was enqueued behind the caller's back
        executor.start().await.unwrap();
        executor.stop().await.unwrap();
        assert!(notifier.events().is_empty());
        assert!(backend.running.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn lifecycle_misuse() {
        let (executor, _) = executor(Arc::new(FakeBackend::default()));
        executor.start().await.unwrap();
        let second = executor.start().await.unwrap_err();
        assert!(matches!(second, ExecutorError::NotStarted(_)));
        assert_eq!(second.to_string(), "executor not started: start() was already called");

        executor.stop().await.unwrap();
        executor.stop().await.unwrap();
        assert!(matches!(executor.start().await, Err(ExecutorError::NotStarted(_))));
        assert!(matches!(
            executor.schedule_task(TaskScheduleCommand::start(key("t", 1))).await,
            Err(ExecutorError::QueueClosed)
        ));
    }

    #[tokio::test]
    async fn start_is_queued_immediately_then_running() {
        let (executor, notifier) = executor(Arc::new(FakeBackend::default()));
        executor.start().await.unwrap();
        let k = key("t", 1);

        executor
            .schedule_task(TaskScheduleCommand::start(k.clone()))
            .await
            .unwrap();
        assert_eq!(notifier.statuses(&k).first(), Some(&TaskStatus::Queued));

        assert!(notifier.wait_for_status(&k, TaskStatus::Running, WAIT).await);
        assert_eq!(notifier.statuses(&k), vec![TaskStatus::Queued, TaskStatus::Running]);
        assert_eq!(executor.live_executions().await, vec![k.clone()]);
        assert_eq!(executor.liveness(&k), Some(Liveness::Alive));
        executor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_then_restart_orders_notifications() {
        let backend = Arc::new(FakeBackend::default());
        let (executor, notifier) = executor(backend.clone());
        executor.start().await.unwrap();
        let current = key("t", 1);
        let next = current.next_attempt();

        executor
            .schedule_task(TaskScheduleCommand::start(current.clone()))
            .await
            .unwrap();
        assert!(notifier.wait_for_status(&current, TaskStatus::Running, WAIT).await);

        executor
            .schedule_task(TaskScheduleCommand::stop(current.clone()))
            .await
            .unwrap();
        executor
            .schedule_task(TaskScheduleCommand::restart(current.clone(), next.clone()))
            .await
            .unwrap();
        assert!(notifier.wait_for_status(&next, TaskStatus::Running, WAIT).await);

        let events = notifier.events();
        let position = |k: &TaskExecutionKey, status: TaskStatus| {
            events
                .iter()
                .position(|e| &e.key == k && e.status == status)
                .expect("status emitted")
        };
        let statuses = notifier.statuses(&current);
        assert_eq!(statuses.iter().filter(|s| **s == TaskStatus::Stopping).count(), 1);
        assert_eq!(statuses.iter().filter(|s| **s == TaskStatus::Restarting).count(), 1);
        assert!(position(&current, TaskStatus::Stopping) < position(&current, TaskStatus::Restarting));
        let first_for_next = events.iter().position(|e| e.key == next).unwrap();
        assert!(position(&current, TaskStatus::Restarting) < first_for_next);
        assert_eq!(notifier.statuses(&next), vec![TaskStatus::Queued, TaskStatus::Running]);

        executor.stop().await.unwrap();
        assert!(backend.stopped.lock().unwrap().contains(&current));
    }

    #[tokio::test]
    async fn failing_start_does_not_stall_the_loop() {
        let (executor, notifier) = executor(Arc::new(FakeBackend::failing(&["bad"])));
        executor.start().await.unwrap();
        let bad = key("bad", 1);
        let good = key("good", 1);

        executor
            .schedule_task(TaskScheduleCommand::start(bad.clone()))
            .await
            .unwrap();
        executor
            .schedule_task(TaskScheduleCommand::start(good.clone()))
            .await
            .unwrap();
        assert!(notifier.wait_for_status(&good, TaskStatus::Running, WAIT).await);

        assert_eq!(notifier.statuses(&bad), vec![TaskStatus::Queued, TaskStatus::Failed]);
        executor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn backend_timeout_is_a_failure() {
        let notifier = Arc::new(RecordingNotifier::new());
        let config = ExecutorConfig {
            backend_timeout: Duration::from_millis(50),
            ..config()
        };
        let executor = TaskExecutorCore::new(
            config,
            Arc::new(FakeBackend::hanging(&["slow"])),
            notifier.clone(),
        );
        executor.start().await.unwrap();
        let slow = key("slow", 1);
        let fast = key("fast", 1);

        executor
            .schedule_task(TaskScheduleCommand::start(slow.clone()))
            .await
            .unwrap();
        executor
            .schedule_task(TaskScheduleCommand::start(fast.clone()))
            .await
            .unwrap();
        assert!(notifier.wait_for_status(&fast, TaskStatus::Running, WAIT).await);
        assert_eq!(notifier.statuses(&slow), vec![TaskStatus::Queued, TaskStatus::Failed]);
        executor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn timed_out_start_is_recovered_by_the_next_check() {
        let backend = Arc::new(FakeBackend::hanging(&["slow"]));
        let notifier = Arc::new(RecordingNotifier::new());
        let config = ExecutorConfig {
            backend_timeout: Duration::from_millis(50),
            ..config()
        };
        let executor = TaskExecutorCore::new(config, backend.clone(), notifier.clone());
        executor.start().await.unwrap();
        let slow = key("slow", 1);
        let next = slow.next_attempt();

        executor
            .schedule_task(TaskScheduleCommand::start(slow.clone()))
            .await
            .unwrap();
        assert!(notifier.wait_for_status(&slow, TaskStatus::Failed, WAIT).await);
        assert_eq!(executor.liveness(&slow), None);

        // the launch may have gone through: stop it, then move on to a new attempt
        assert_eq!(executor.check_heartbeats().await.unwrap(), vec![slow.clone()]);
        assert!(notifier.wait_for_status(&next, TaskStatus::Failed, WAIT).await);
        assert_eq!(
            notifier.statuses(&slow),
            vec![TaskStatus::Queued, TaskStatus::Failed, TaskStatus::Restarting]
        );
        assert!(backend.stopped.lock().unwrap().contains(&slow));
        assert_eq!(notifier.statuses(&next), vec![TaskStatus::Queued, TaskStatus::Failed]);

        // each check retries once more, never twice for the same attempt
        assert_eq!(executor.check_heartbeats().await.unwrap(), vec![next.clone()]);
        executor.stop().await.unwrap();
        assert_eq!(
            notifier.statuses(&slow),
            vec![TaskStatus::Queued, TaskStatus::Failed, TaskStatus::Restarting]
        );
    }

    #[tokio::test]
    async fn restart_is_aborted_when_the_current_attempt_will_not_stop() {
        let backend = Arc::new(FakeBackend::unstoppable(&["sticky"]));
        let (executor, notifier) = executor(backend.clone());
        executor.start().await.unwrap();
        let current = key("sticky", 1);
        let next = current.next_attempt();
        let other = key("other", 1);

        executor
            .schedule_task(TaskScheduleCommand::start(current.clone()))
            .await
            .unwrap();
        executor
            .schedule_task(TaskScheduleCommand::restart(current.clone(), next.clone()))
            .await
            .unwrap();
        executor
            .schedule_task(TaskScheduleCommand::start(other.clone()))
            .await
            .unwrap();
        assert!(notifier.wait_for_status(&other, TaskStatus::Running, WAIT).await);

        assert_eq!(
            notifier.statuses(&current),
            vec![
                TaskStatus::Queued,
                TaskStatus::Running,
                TaskStatus::Restarting,
                TaskStatus::Failed
            ]
        );
        assert!(notifier.statuses(&next).is_empty());
        assert_eq!(executor.live_executions().await, vec![other.clone()]);

        // the restart is retried on the next check, toward the same replacement
        let before = notifier.events().len();
        assert_eq!(executor.check_heartbeats().await.unwrap(), vec![current.clone()]);
        assert!(notifier.wait_for_events(before + 2, WAIT).await);
        assert_eq!(
            notifier.statuses(&current)[4..],
            [TaskStatus::Restarting, TaskStatus::Failed]
        );
        assert!(notifier.statuses(&next).is_empty());
        executor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn backend_outcomes_finish_live_attempts() {
        let backend = Arc::new(FakeBackend::default());
        let (executor, notifier) = executor(backend.clone());
        executor.start().await.unwrap();
        let ok = key("ok", 1);
        let broken = key("broken", 1);

        for k in [&ok, &broken] {
            executor
                .schedule_task(TaskScheduleCommand::start(k.clone()))
                .await
                .unwrap();
            assert!(notifier.wait_for_status(k, TaskStatus::Running, WAIT).await);
        }
        backend.finish(&ok, ExecutionOutcome::Success);
        backend.finish(&broken, ExecutionOutcome::Failed("exit 1".into()));

        assert!(notifier.wait_for_status(&ok, TaskStatus::Success, WAIT).await);
        assert!(notifier.wait_for_status(&broken, TaskStatus::Failed, WAIT).await);
        assert!(executor.live_executions().await.is_empty());
        assert_eq!(executor.liveness(&ok), None);
        executor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_drains_accepted_commands() {
        let backend = Arc::new(FakeBackend::default());
        let (executor, notifier) = executor(backend.clone());
        executor.start().await.unwrap();

        let keys: Vec<_> = (1..=5).map(|i| key(&format!("task-{i}"), 1)).collect();
        for k in &keys {
            executor
                .schedule_task(TaskScheduleCommand::start(k.clone()))
                .await
                .unwrap();
        }
        executor.stop().await.unwrap();

        for k in &keys {
            assert_eq!(notifier.statuses(k), vec![TaskStatus::Queued, TaskStatus::Running]);
        }
        assert!(backend.shut_down.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn dead_attempt_is_restarted_once() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let backend = Arc::new(FakeBackend::default());
        let notifier = Arc::new(RecordingNotifier::new());
        let executor = TaskExecutorCore::new(config(), backend.clone(), notifier.clone())
            .with_clock(clock.clone());
        executor.start().await.unwrap();
        let k = key("t", 1);

        executor
            .schedule_task(TaskScheduleCommand::start(k.clone()))
            .await
            .unwrap();
        assert!(notifier.wait_for_status(&k, TaskStatus::Running, WAIT).await);

        clock.advance(Duration::from_secs(30));
        executor.record_heartbeat(&k);
        clock.advance(Duration::from_secs(30));
        assert!(executor.check_heartbeats().await.unwrap().is_empty());

        clock.advance(Duration::from_secs(61));
        assert_eq!(executor.check_heartbeats().await.unwrap(), vec![k.clone()]);
        assert!(executor.check_heartbeats().await.unwrap().is_empty());

        let next = k.next_attempt();
        assert!(notifier.wait_for_status(&next, TaskStatus::Running, WAIT).await);
        assert!(executor.check_heartbeats().await.unwrap().is_empty());

        assert_eq!(
            notifier.statuses(&k),
            vec![TaskStatus::Queued, TaskStatus::Running, TaskStatus::Restarting]
        );
        assert_eq!(notifier.statuses(&next), vec![TaskStatus::Queued, TaskStatus::Running]);
        assert_eq!(executor.liveness(&k), None);
        assert_eq!(executor.live_executions().await, vec![next]);
        executor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn dead_attempt_is_failed_under_stop_policy() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let notifier = Arc::new(RecordingNotifier::new());
        let config = ExecutorConfig {
            heartbeat_policy: HeartbeatPolicy::Stop,
            ..config()
        };
        let executor = TaskExecutorCore::new(config, Arc::new(FakeBackend::default()), notifier.clone())
            .with_clock(clock.clone());
        executor.start().await.unwrap();
        let k = key("t", 1);

        executor
            .schedule_task(TaskScheduleCommand::start(k.clone()))
            .await
            .unwrap();
        assert!(notifier.wait_for_status(&k, TaskStatus::Running, WAIT).await);

        clock.advance(Duration::from_secs(90));
        executor.check_heartbeats().await.unwrap();
        assert!(notifier.wait_for_status(&k, TaskStatus::Failed, WAIT).await);
        assert_eq!(
            notifier.statuses(&k),
            vec![
                TaskStatus::Queued,
                TaskStatus::Running,
                TaskStatus::Stopping,
                TaskStatus::Failed
            ]
        );
        executor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn journal_is_replayed_on_start() {
        let journal = Arc::new(InMemoryCommandJournal::new());
        let k = key("recovered", 1);
        journal
            .append(&QueuedCommand {
                seq: 41,
                command: TaskScheduleCommand::start(k.clone()),
                enqueued_at: Utc::now(),
                origin: CommandOrigin::External,
            })
            .await
            .unwrap();

        let notifier = Arc::new(RecordingNotifier::new());
        let executor = TaskExecutorCore::new(config(), Arc::new(FakeBackend::default()), notifier.clone())
            .with_journal(journal.clone());
        executor.start().await.unwrap();

        assert!(notifier.wait_for_status(&k, TaskStatus::Running, WAIT).await);
        assert_eq!(notifier.statuses(&k), vec![TaskStatus::Queued, TaskStatus::Running]);
        executor.stop().await.unwrap();
        assert!(journal.pending().await.unwrap().is_empty());
    }
}
