//! Aggregate response for one batch.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OptimizerError, OptimizerErrorKind};
use crate::{DetectionOutcome, LaneError, OptimizerResult, LANE_COUNT};

/// Why the optimizer stage failed, with enough structure to decide on a retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerFailure {
    pub kind: OptimizerErrorKind,
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<f64>,

    /// Retrying the same counts might succeed.
    pub retryable: bool,
}

impl From<&OptimizerError> for OptimizerFailure {
    fn from(error: &OptimizerError) -> Self {
        let (exit_code, timeout_secs) = match error {
            OptimizerError::NonZeroExit { exit_code } => (Some(*exit_code), None),
            OptimizerError::Timeout { timeout } => (None, Some(timeout.as_secs_f64())),
            _ => (None, None),
        };
        Self {
            kind: error.kind(),
            message: error.to_string(),
            exit_code,
            timeout_secs,
            retryable: error.is_transient(),
        }
    }
}

impl From<OptimizerError> for OptimizerFailure {
    fn from(error: OptimizerError) -> Self {
        Self::from(&error)
    }
}

/// Outcome of the best-effort recommendation step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecommendationOutcome {
    Recommended { recommendation: Value },
    Failed { error: String },
    /// Not attempted: no recommender configured, or an earlier stage failed.
    #[default]
    Skipped,
}

/// Stage at which a batch stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStage {
    /// Detection, optimization and (best-effort) recommendation all ran.
    Completed,
    /// At least one lane has no count; the optimizer was not run.
    DetectionFailed,
    /// Counts were complete but the optimizer failed.
    OptimizationFailed,
}

/// Everything one batch produced.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateResponse {
    pub stage: BatchStage,

    /// Counts in lane order. Lanes without a count are zero.
    pub per_lane_counts: [u64; LANE_COUNT],

    /// Raw per-lane outcomes from the worker pool.
    pub lanes: Vec<DetectionOutcome>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub detection_errors: Vec<LaneError>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimizer_result: Option<OptimizerResult>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimizer_error: Option<OptimizerFailure>,

    pub rl_recommendation: RecommendationOutcome,

    pub elapsed_seconds: f64,
}

impl AggregateResponse {
    /// Response for a batch that stopped at detection.
    pub fn detection_failed(
        per_lane_counts: [u64; LANE_COUNT],
        lanes: Vec<DetectionOutcome>,
        detection_errors: Vec<LaneError>,
    ) -> Self {
        Self {
            stage: BatchStage::DetectionFailed,
            per_lane_counts,
            lanes,
            detection_errors,
            optimizer_result: None,
            optimizer_error: None,
            rl_recommendation: RecommendationOutcome::Skipped,
            elapsed_seconds: 0.0,
        }
    }

    /// Response for a batch that stopped at the optimizer.
    pub fn optimization_failed(
        per_lane_counts: [u64; LANE_COUNT],
        lanes: Vec<DetectionOutcome>,
        optimizer_result: Option<OptimizerResult>,
        error: impl Into<OptimizerFailure>,
    ) -> Self {
        Self {
            stage: BatchStage::OptimizationFailed,
            per_lane_counts,
            lanes,
            detection_errors: Vec::new(),
            optimizer_result,
            optimizer_error: Some(error.into()),
            rl_recommendation: RecommendationOutcome::Skipped,
            elapsed_seconds: 0.0,
        }
    }

    /// Response for a batch that reached the recommendation step.
    pub fn completed(
        per_lane_counts: [u64; LANE_COUNT],
        lanes: Vec<DetectionOutcome>,
        optimizer_result: OptimizerResult,
        rl_recommendation: RecommendationOutcome,
    ) -> Self {
        Self {
            stage: BatchStage::Completed,
            per_lane_counts,
            lanes,
            detection_errors: Vec::new(),
            optimizer_result: Some(optimizer_result),
            optimizer_error: None,
            rl_recommendation,
            elapsed_seconds: 0.0,
        }
    }

    pub fn with_elapsed_seconds(mut self, elapsed_seconds: f64) -> Self {
        self.elapsed_seconds = elapsed_seconds;
        self
    }

    pub fn is_success(&self) -> bool {
        self.stage == BatchStage::Completed
    }
}
