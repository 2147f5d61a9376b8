//! Error taxonomy for detection, optimization, recommendation and run
//! recording.
//!
//! Each stage has its own enum so a caller can tell "could not detect" from
//! "could not optimize" from "could not recommend" and retry only that stage.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from a single optimizer invocation.
#[derive(Debug, Error)]
pub enum OptimizerError {
    /// The optimizer executable does not exist at its configured path.
    #[error("Optimizer binary not found at '{}'", path.display())]
    BinaryNotFound { path: PathBuf },

    /// The car counts could not be coerced to four non-negative integers.
    #[error("Invalid input for optimizer: {0}")]
    InvalidInput(String),

    /// The optimizer did not exit within its deadline and was killed.
    #[error("Optimizer timed out after {}s", timeout.as_secs_f64())]
    Timeout { timeout: Duration },

    /// The optimizer exited with a non-zero status.
    #[error("Optimizer returned non-zero exit code {exit_code}")]
    NonZeroExit { exit_code: i32 },

    /// Failed to spawn the optimizer process.
    #[error("Failed to run optimizer: {0}")]
    Spawn(#[from] std::io::Error),

    /// The optimizer exited cleanly but printed an `error` field.
    #[error("Optimizer reported an error: {0}")]
    Reported(String),
}

/// Discriminant of `OptimizerError`, as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerErrorKind {
    BinaryNotFound,
    InvalidInput,
    Timeout,
    NonZeroExit,
    Spawn,
    Reported,
}

impl OptimizerError {
    /// Returns true if retrying the same invocation might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Spawn(_))
    }

    pub fn kind(&self) -> OptimizerErrorKind {
        match self {
            Self::BinaryNotFound { .. } => OptimizerErrorKind::BinaryNotFound,
            Self::InvalidInput(_) => OptimizerErrorKind::InvalidInput,
            Self::Timeout { .. } => OptimizerErrorKind::Timeout,
            Self::NonZeroExit { .. } => OptimizerErrorKind::NonZeroExit,
            Self::Spawn(_) => OptimizerErrorKind::Spawn,
            Self::Reported(_) => OptimizerErrorKind::Reported,
        }
    }
}

/// Per-lane detection failures.
///
/// These are collected into the lane's outcome as strings, never thrown past
/// the pool.
#[derive(Debug, Error)]
pub enum DetectionError {
    /// The worker process could not be started.
    #[error("Failed to start detection worker: {0}")]
    Spawn(String),

    /// The worker ran but reported a failure.
    #[error("Detection failed: {0}")]
    Failed(String),

    /// The worker exited successfully but its output was not a count.
    #[error("Invalid detection output: {0}")]
    InvalidOutput(String),

    /// The worker exceeded its per-task deadline.
    #[error("Timeout after {}s", timeout.as_secs_f64())]
    Timeout { timeout: Duration },

    /// The batch deadline expired before this lane reported.
    #[error("Timeout")]
    BatchTimeout,
}

/// Failures of the best-effort recommendation step.
#[derive(Debug, Error)]
pub enum RecommendationError {
    #[error("Recommendation failed: {0}")]
    Failed(String),

    #[error("Recommendation timed out after {}s", timeout.as_secs_f64())]
    Timeout { timeout: Duration },

    #[error("Failed to run recommender: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Invalid recommender output: {0}")]
    InvalidOutput(#[from] serde_json::Error),
}

/// Failures persisting a completed run. Logged, never returned to the caller.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Failed to write run record: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode run record: {0}")]
    Encode(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_timeout_message() {
        assert_eq!(DetectionError::BatchTimeout.to_string(), "Timeout");
    }

    #[test]
    fn test_transient_classification() {
        let timeout = OptimizerError::Timeout {
            timeout: Duration::from_secs(30),
        };
        assert!(timeout.is_transient());
        assert!(!OptimizerError::InvalidInput("x".to_string()).is_transient());
        assert!(!OptimizerError::NonZeroExit { exit_code: 7 }.is_transient());
        assert!(!OptimizerError::Reported("bad counts".to_string()).is_transient());
    }

    #[test]
    fn test_kind() {
        let missing = OptimizerError::BinaryNotFound {
            path: PathBuf::from("/opt/Algo1"),
        };
        assert_eq!(missing.kind(), OptimizerErrorKind::BinaryNotFound);
        assert_eq!(
            OptimizerError::NonZeroExit { exit_code: 2 }.kind(),
            OptimizerErrorKind::NonZeroExit
        );
        assert_eq!(
            serde_json::to_value(OptimizerErrorKind::NonZeroExit).unwrap(),
            serde_json::json!("non_zero_exit")
        );
    }
}
