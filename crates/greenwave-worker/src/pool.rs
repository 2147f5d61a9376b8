//! Detection worker pool.
//!
//! Every task runs in its own child process so that a leak or crash in the
//! native inference code of one lane cannot affect another lane or the host.
//! A supervisor task per worker enforces the per-task deadline and sends the
//! lane's outcome over a bounded channel; the coordinator is the only reader
//! and writes each outcome back into its lane slot.

use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};

use greenwave_core::{DetectionError, DetectionOutcome, DetectionTask};
use greenwave_process::terminate;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::launcher::WorkerLauncher;
use crate::report::parse_report;

/// One worker per lane.
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// Per-task deadline.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(300);

/// Deadline for the whole batch.
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(600);

/// Time a worker gets to exit after SIGTERM before it is killed.
pub use greenwave_process::DEFAULT_GRACE_PERIOD;

const STDOUT_LIMIT: usize = 64 * 1024;
const STDERR_TAIL: usize = 2 * 1024;

/// What a lane reports when its worker exceeds the per-task deadline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Report a count of zero and no error. A slow lane never blocks the batch.
    #[default]
    DegradeToZero,
    /// Report the timeout as a lane error.
    Fail,
}

/// Pool limits.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_workers: usize,
    pub task_timeout: Duration,
    pub batch_timeout: Duration,
    pub grace_period: Duration,
    pub timeout_policy: TimeoutPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            task_timeout: DEFAULT_TASK_TIMEOUT,
            batch_timeout: DEFAULT_BATCH_TIMEOUT,
            grace_period: DEFAULT_GRACE_PERIOD,
            timeout_policy: TimeoutPolicy::default(),
        }
    }
}

/// Runs detection tasks in isolated worker processes.
pub struct DetectionWorkerPool {
    launcher: Arc<dyn WorkerLauncher>,
    config: PoolConfig,
}

impl DetectionWorkerPool {
    /// Create a pool with default limits.
    pub fn new(launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self {
            launcher,
            config: PoolConfig::default(),
        }
    }

    pub fn with_config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Run a batch with the configured worker limit.
    pub async fn run_batch(&self, tasks: &[DetectionTask]) -> Vec<DetectionOutcome> {
        self.run(tasks, self.config.max_workers).await
    }

    /// Run every task, at most `max_workers` at a time.
    ///
    /// Returns one outcome per task, in task order, whatever order the
    /// workers finish in. Never fails as a whole: spawn errors, crashes and
    /// timeouts are recorded on the affected lane only.
    pub async fn run(&self, tasks: &[DetectionTask], max_workers: usize) -> Vec<DetectionOutcome> {
        let total = tasks.len();
        let mut outcomes: Vec<DetectionOutcome> = tasks
            .iter()
            .map(|t| DetectionOutcome::pending(t.lane_index))
            .collect();
        if total == 0 {
            return outcomes;
        }

        let max_workers = max_workers.max(1);
        info!(
            tasks = total,
            max_workers = max_workers,
            task_timeout_secs = self.config.task_timeout.as_secs_f64(),
            batch_timeout_secs = self.config.batch_timeout.as_secs_f64(),
            "Starting detection batch"
        );

        let started = Instant::now();
        let semaphore = Arc::new(Semaphore::new(max_workers));
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel::<(usize, DetectionOutcome)>(total);
        let mut supervisors = JoinSet::new();

        for (slot, task) in tasks.iter().cloned().enumerate() {
            let launcher = Arc::clone(&self.launcher);
            let config = self.config.clone();
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let tx = tx.clone();

            supervisors.spawn(async move {
                let _permit = tokio::select! {
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    },
                    _ = cancel.cancelled() => return,
                };

                if let Some(outcome) = supervise(launcher.as_ref(), &task, &config, &cancel).await {
                    // Capacity equals the task count, so this never waits.
                    let _ = tx.send((slot, outcome)).await;
                }
            });
        }
        drop(tx);

        let deadline = tokio::time::sleep(self.config.batch_timeout);
        tokio::pin!(deadline);
        let mut collected = 0usize;
        let mut batch_expired = false;

        while collected < total {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some((slot, outcome)) => {
                        info!(
                            lane = outcome.lane_index,
                            count = ?outcome.count,
                            error = ?outcome.error,
                            timed_out = outcome.timed_out,
                            elapsed_ms = outcome.elapsed_ms,
                            "Detection worker completed"
                        );
                        outcomes[slot] = outcome;
                        collected += 1;
                    }
                    None => break,
                },
                _ = &mut deadline => {
                    warn!(
                        collected = collected,
                        total = total,
                        "Batch timeout - terminating remaining workers"
                    );
                    batch_expired = true;
                    cancel.cancel();
                    break;
                }
            }
        }

        // Cancelled supervisors terminate their workers before returning.
        while let Some(joined) = supervisors.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Detection supervisor task failed");
            }
        }
        while let Ok((slot, outcome)) = rx.try_recv() {
            if !outcomes[slot].is_complete() {
                outcomes[slot] = outcome;
            }
        }

        for outcome in outcomes.iter_mut().filter(|o| !o.is_complete()) {
            let error = if batch_expired {
                DetectionError::BatchTimeout.to_string()
            } else {
                "Worker exited without reporting a result".to_string()
            };
            warn!(lane = outcome.lane_index, error = %error, "No result collected for lane");
            outcome.error = Some(error);
        }

        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            counts = ?outcomes.iter().map(|o| o.count).collect::<Vec<_>>(),
            "Detection batch complete"
        );

        outcomes
    }
}

enum WorkerExit {
    Finished(std::io::Result<(ExitStatus, String, String)>),
    TimedOut,
    Cancelled,
}

/// Run one worker to completion, timeout or cancellation.
///
/// Returns `None` only when cancelled; the coordinator then decides what the
/// lane reports.
async fn supervise(
    launcher: &dyn WorkerLauncher,
    task: &DetectionTask,
    config: &PoolConfig,
    cancel: &CancellationToken,
) -> Option<DetectionOutcome> {
    let lane = task.lane_index;
    let started = Instant::now();
    let elapsed_ms = || started.elapsed().as_millis() as u64;

    let mut child = match launcher.spawn(task) {
        Ok(child) => child,
        Err(e) => {
            error!(lane = lane, error = %e, "Failed to start detection worker");
            return Some(DetectionOutcome::failed(lane, e.to_string()).with_elapsed_ms(elapsed_ms()));
        }
    };

    info!(
        lane = lane,
        pid = ?child.id(),
        video = %task.video_path.display(),
        "Detection worker started"
    );

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        terminate(&mut child, config.grace_period).await;
        let e = DetectionError::Spawn("worker output is not piped".to_string());
        return Some(DetectionOutcome::failed(lane, e.to_string()).with_elapsed_ms(elapsed_ms()));
    };

    let exit = {
        let collect = async {
            let (status, out, err) = tokio::join!(
                child.wait(),
                read_tail(stdout, STDOUT_LIMIT),
                read_tail(stderr, STDERR_TAIL)
            );
            Ok::<_, std::io::Error>((status?, out?, err?))
        };

        tokio::select! {
            res = tokio::time::timeout(config.task_timeout, collect) => match res {
                Ok(finished) => WorkerExit::Finished(finished),
                Err(_) => WorkerExit::TimedOut,
            },
            _ = cancel.cancelled() => WorkerExit::Cancelled,
        }
    };

    let outcome = match exit {
        WorkerExit::Finished(Ok((status, stdout, stderr))) => {
            outcome_from_exit(lane, status, &stdout, &stderr)
        }
        WorkerExit::Finished(Err(e)) => {
            terminate(&mut child, config.grace_period).await;
            let e = DetectionError::Failed(format!("lost worker output: {}", e));
            DetectionOutcome::failed(lane, e.to_string())
        }
        WorkerExit::TimedOut => {
            warn!(
                lane = lane,
                timeout_secs = config.task_timeout.as_secs_f64(),
                "Detection worker timed out - terminating"
            );
            terminate(&mut child, config.grace_period).await;
            let mut outcome = match config.timeout_policy {
                TimeoutPolicy::DegradeToZero => DetectionOutcome::counted(lane, 0),
                TimeoutPolicy::Fail => {
                    let e = DetectionError::Timeout {
                        timeout: config.task_timeout,
                    };
                    DetectionOutcome::failed(lane, e.to_string())
                }
            };
            outcome.timed_out = true;
            outcome
        }
        WorkerExit::Cancelled => {
            debug!(lane = lane, "Detection worker cancelled");
            terminate(&mut child, config.grace_period).await;
            return None;
        }
    };

    Some(outcome.with_elapsed_ms(elapsed_ms()))
}

fn outcome_from_exit(lane: usize, status: ExitStatus, stdout: &str, stderr: &str) -> DetectionOutcome {
    if !status.success() {
        let code = status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let detail = stderr.trim();
        let message = if detail.is_empty() {
            format!("worker exited with code {}", code)
        } else {
            format!("worker exited with code {}: {}", code, last_line(detail))
        };
        return DetectionOutcome::failed(lane, DetectionError::Failed(message).to_string());
    }

    match parse_report(stdout) {
        Ok(count) => DetectionOutcome::counted(lane, count),
        Err(e) => DetectionOutcome::failed(lane, e.to_string()),
    }
}

fn last_line(text: &str) -> &str {
    text.lines().rev().map(str::trim).find(|l| !l.is_empty()).unwrap_or(text)
}

/// Read to EOF, keeping at most the last `limit` bytes.
async fn read_tail<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> std::io::Result<String> {
    let mut tail = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        tail.extend_from_slice(&chunk[..n]);
        if tail.len() > limit {
            let excess = tail.len() - limit;
            tail.drain(..excess);
        }
    }
    Ok(String::from_utf8_lossy(&tail).into_owned())
}
