//! Reinforcement-learning recommendation collaborator.
//!
//! The recommendation runs after a successful optimization and is
//! best-effort: its failures are reported in the response but never fail the
//! batch.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use greenwave_core::{OptimizerResult, RecommendationError, LANE_COUNT};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Default deadline for one recommendation.
pub const DEFAULT_RECOMMENDER_TIMEOUT: Duration = Duration::from_secs(10);

/// Produces a phase recommendation from lane counts and the optimizer output.
#[async_trait]
pub trait Recommender: Send + Sync {
    async fn recommend(
        &self,
        counts: [u64; LANE_COUNT],
        optimizer: &OptimizerResult,
    ) -> Result<Value, RecommendationError>;
}

/// Runs an external recommender executable.
///
/// The request `{"counts": [...], "optimizer": {...}}` is written to the
/// child's stdin as one line; the child prints one JSON value on stdout.
#[derive(Debug, Clone)]
pub struct CommandRecommender {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandRecommender {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: DEFAULT_RECOMMENDER_TIMEOUT,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

#[async_trait]
impl Recommender for CommandRecommender {
    async fn recommend(
        &self,
        counts: [u64; LANE_COUNT],
        optimizer: &OptimizerResult,
    ) -> Result<Value, RecommendationError> {
        let request = json!({
            "counts": counts,
            "optimizer": optimizer.to_json(),
        });

        info!(program = %self.program.display(), counts = ?counts, "Requesting recommendation");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| RecommendationError::Failed("recommender stdin not captured".to_string()))?;

        let line = format!("{}\n", request);
        let write = async move {
            // A recommender may exit without reading its input.
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                debug!(error = %e, "Recommender closed stdin early");
            }
        };
        // The child may fill its stdout or stderr pipe before draining stdin.
        let exchange = async {
            let ((), output) = tokio::join!(write, child.wait_with_output());
            output
        };

        let output = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| {
                warn!(timeout_secs = self.timeout.as_secs_f64(), "Recommender timed out");
                RecommendationError::Timeout {
                    timeout: self.timeout,
                }
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr.trim().lines().last().unwrap_or("").to_string();
            let code = output.status.code().unwrap_or(-1);
            return Err(RecommendationError::Failed(if detail.is_empty() {
                format!("exit code {}", code)
            } else {
                format!("exit code {}: {}", code, detail)
            }));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let value: Value = serde_json::from_str(stdout.trim())?;

        if let Some(error) = value.get("error").and_then(Value::as_str) {
            return Err(RecommendationError::Failed(error.to_string()));
        }

        debug!(recommendation = %value, "Recommendation received");
        Ok(value)
    }
}
