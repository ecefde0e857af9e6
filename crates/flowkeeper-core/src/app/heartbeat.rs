//! Heartbeat tracking and the monitor that acts on silence.
//!
//! Per live attempt: ALIVE -> SUSPECT -> DEAD.
//! - silence longer than `heartbeat_interval`: SUSPECT (a beat revives it)
//! - silence longer than `heartbeat_timeout`: DEAD, and exactly one recovery
//!   command goes through `CommandIngress`
//!
//! A DEAD entry is forgotten by the processing loop once the replacement
//! attempt is QUEUED or the dead attempt reaches a terminal status.
//!
//! Attempts whose launch or stop the backend never confirmed are not live,
//! but may still be running. The loop hands them over with `needs_recovery`
//! and the next check submits their recovery command.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::ingress::CommandIngress;
use super::processor::LiveExecutions;
use crate::config::{ExecutorConfig, HeartbeatPolicy};
use crate::domain::{TaskExecutionKey, TaskScheduleCommand};
use crate::ports::{Clock, HeartbeatSink};
use crate::queue::CommandOrigin;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Suspect,
    Dead,
}

#[derive(Debug, Clone, Copy)]
struct Tracked {
    last_beat: DateTime<Utc>,
    liveness: Liveness,
}

/// Last heartbeat per attempt.
pub struct HeartbeatTable {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<TaskExecutionKey, Tracked>>,
    /// Unconfirmed attempt -> the attempt that should replace it.
    recoveries: Mutex<HashMap<TaskExecutionKey, TaskExecutionKey>>,
}

impl HeartbeatTable {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
            recoveries: Mutex::new(HashMap::new()),
        }
    }

    /// Launch confirmed: the silence window starts now.
    pub fn track(&self, key: &TaskExecutionKey) {
        let now = self.clock.now();
        self.entries().insert(
            key.clone(),
            Tracked {
                last_beat: now,
                liveness: Liveness::Alive,
            },
        );
    }

    pub fn forget(&self, key: &TaskExecutionKey) {
        self.entries().remove(key);
        self.recoveries().remove(key);
    }

    /// The backend did not confirm a launch or stop of `key`.
    pub fn needs_recovery(&self, key: &TaskExecutionKey, replacement: TaskExecutionKey) {
        debug!(key = %key, replacement = %replacement, "attempt handed to recovery");
        self.recoveries().insert(key.clone(), replacement);
    }

    #[cfg(test)]
    pub(crate) fn pending_recoveries(&self) -> usize {
        self.recoveries().len()
    }

    fn take_recoveries(&self) -> Vec<(TaskExecutionKey, TaskExecutionKey)> {
        let mut taken: Vec<_> = self.recoveries().drain().collect();
        taken.sort();
        taken
    }

    pub fn liveness(&self, key: &TaskExecutionKey) -> Option<Liveness> {
        self.entries().get(key).map(|tracked| tracked.liveness)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<TaskExecutionKey, Tracked>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn recoveries(&self) -> std::sync::MutexGuard<'_, HashMap<TaskExecutionKey, TaskExecutionKey>> {
        self.recoveries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl HeartbeatSink for HeartbeatTable {
    fn beat(&self, key: &TaskExecutionKey) {
        let now = self.clock.now();
        let mut entries = self.entries();
        let tracked = entries.entry(key.clone()).or_insert(Tracked {
            last_beat: now,
            liveness: Liveness::Alive,
        });
        tracked.last_beat = now;
        // DEAD is final; recovery is already under way
        if tracked.liveness == Liveness::Suspect {
            debug!(key = %key, "heartbeat resumed");
            tracked.liveness = Liveness::Alive;
        }
    }
}

pub struct HeartbeatMonitor {
    table: Arc<HeartbeatTable>,
    live: LiveExecutions,
    ingress: Arc<CommandIngress>,
    clock: Arc<dyn Clock>,
    check_interval: Duration,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    policy: HeartbeatPolicy,
}

impl HeartbeatMonitor {
    pub fn new(
        config: &ExecutorConfig,
        table: Arc<HeartbeatTable>,
        live: LiveExecutions,
        ingress: Arc<CommandIngress>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            table,
            live,
            ingress,
            clock,
            check_interval: config.heartbeat_check_interval,
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_timeout: config.heartbeat_timeout,
            policy: config.heartbeat_policy,
        }
    }

    /// One pass over the live attempts and the unconfirmed ones. Returns the
    /// keys a recovery command was submitted for: attempts declared DEAD by
    /// this pass, then attempts handed over with `needs_recovery`.
    pub async fn check_once(&self) -> Vec<TaskExecutionKey> {
        let live: HashSet<TaskExecutionKey> = self.live.read().await.keys().cloned().collect();
        let now = self.clock.now();

        let mut dead = {
            let mut entries = self.table.entries();
            entries.retain(|key, tracked| tracked.liveness == Liveness::Dead || live.contains(key));

            let mut dead = Vec::new();
            for key in &live {
                let tracked = entries.entry(key.clone()).or_insert(Tracked {
                    last_beat: now,
                    liveness: Liveness::Alive,
                });
                if tracked.liveness == Liveness::Dead {
                    continue;
                }
                let silence = (now - tracked.last_beat).to_std().unwrap_or_default();
                if silence > self.heartbeat_timeout {
                    tracked.liveness = Liveness::Dead;
                    dead.push(key.clone());
                } else if silence > self.heartbeat_interval && tracked.liveness == Liveness::Alive {
                    debug!(key = %key, ?silence, "heartbeat late");
                    tracked.liveness = Liveness::Suspect;
                }
            }
            dead
        };
        dead.sort();

        for key in &dead {
            warn!(key = %key, "heartbeat timed out, execution presumed dead");
            self.recover(key, key.next_attempt()).await;
        }

        let unconfirmed = self.table.take_recoveries();
        for (key, replacement) in unconfirmed {
            warn!(key = %key, "backend never confirmed the attempt, recovering");
            self.recover(&key, replacement).await;
            dead.push(key);
        }
        dead
    }

    async fn recover(&self, key: &TaskExecutionKey, replacement: TaskExecutionKey) {
        let command = match self.policy {
            HeartbeatPolicy::Restart => TaskScheduleCommand::restart(key.clone(), replacement),
            HeartbeatPolicy::Stop => TaskScheduleCommand::stop(key.clone()),
        };
        info!(key = %key, action = %command.action, "submitting recovery command");
        if let Err(e) = self.ingress.submit(command, CommandOrigin::Heartbeat).await {
            warn!(key = %key, error = %e, "recovery command rejected");
        }
    }

    /// Check every `heartbeat_check_interval` until shutdown is signalled.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        // nothing is live yet at startup; the first check is one interval in
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.check_interval,
            self.check_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(every = ?self.check_interval, "heartbeat monitor started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.check_once().await;
                }
            }
        }
        info!("heartbeat monitor stopped");
    }
}
