//! External CLI plumbing shared by the container and cluster backends.
//!
//! `CommandRunner` is the seam: `ProcessRunner` spawns the real binary,
//! tests use a recording runner with canned replies.

use std::future::Future;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::TaskExecutionKey;
use crate::ports::{ExecutionContext, ExecutionOutcome};

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program args...`, feeding `stdin` if given.
    /// `Ok(stdout)` on exit status 0, `Err(stderr)` otherwise.
    async fn run(&self, program: &str, args: &[String], stdin: Option<&str>)
    -> Result<String, String>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<&str>,
    ) -> Result<String, String> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to execute {program}: {e}"))?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())
                .await
                .map_err(|e| format!("failed to write stdin of {program}: {e}"))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| format!("failed to wait for {program}: {e}"))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).to_string())
        }
    }
}

/// What a status probe saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    Running,
    Finished(ExecutionOutcome),
    Missing,
    /// Probe itself failed; try again next tick.
    Unknown(String),
}

/// Poll `probe` every `interval` until the attempt finishes or `token` is
/// cancelled. Running attempts heartbeat; finished ones report their outcome.
pub(crate) fn spawn_watcher<F, Fut>(
    key: TaskExecutionKey,
    ctx: ExecutionContext,
    interval: Duration,
    token: CancellationToken,
    probe: F,
) where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Probe> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match probe().await {
                Probe::Running => ctx.heartbeat(&key),
                Probe::Finished(outcome) => {
                    ctx.report_outcome(key, outcome);
                    break;
                }
                Probe::Missing => {
                    if !token.is_cancelled() {
                        ctx.report_outcome(
                            key,
                            ExecutionOutcome::Failed("execution disappeared".into()),
                        );
                    }
                    break;
                }
                Probe::Unknown(reason) => debug!(key = %key, reason = %reason, "status probe failed"),
            }
        }
    });
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Records invocations and pops canned replies in order; `Ok("")` once empty.
    #[derive(Default)]
    pub struct RecordingRunner {
        replies: Mutex<Vec<Result<String, String>>>,
        calls: Mutex<Vec<(String, Vec<String>, Option<String>)>>,
    }

    impl RecordingRunner {
        pub fn with_replies(mut replies: Vec<Result<String, String>>) -> Self {
            replies.reverse();
            Self {
                replies: Mutex::new(replies),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> Vec<(String, Vec<String>, Option<String>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(
            &self,
            program: &str,
            args: &[String],
            stdin: Option<&str>,
        ) -> Result<String, String> {
            self.calls.lock().unwrap().push((
                program.to_string(),
                args.to_vec(),
                stdin.map(str::to_string),
            ));
            self.replies.lock().unwrap().pop().unwrap_or(Ok(String::new()))
        }
    }
}
