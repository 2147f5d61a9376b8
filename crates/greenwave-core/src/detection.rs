//! Detection task and outcome types.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::Lane;

/// One video to analyze, bound to its lane position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionTask {
    /// Position of this lane in the batch (0..3).
    pub lane_index: usize,

    /// Video file the worker should analyze.
    pub video_path: PathBuf,
}

impl DetectionTask {
    /// Create a new DetectionTask.
    pub fn new(lane_index: usize, video_path: impl Into<PathBuf>) -> Self {
        Self {
            lane_index,
            video_path: video_path.into(),
        }
    }

    /// Build one task per path, indexed by position.
    pub fn batch<I, P>(paths: I) -> Vec<Self>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        paths
            .into_iter()
            .enumerate()
            .map(|(i, p)| Self::new(i, p))
            .collect()
    }

    /// The named lane, when the index is one of the four approaches.
    pub fn lane(&self) -> Option<Lane> {
        Lane::from_index(self.lane_index)
    }
}

/// Result slot for one lane.
///
/// Exactly one of `count`/`error` is set once the worker completes. Both
/// absent means the lane never reported.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionOutcome {
    pub lane_index: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Set when the per-task deadline expired and the count was degraded.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub timed_out: bool,

    /// Wall-clock time spent on this lane.
    #[serde(default)]
    pub elapsed_ms: u64,
}

impl DetectionOutcome {
    /// Empty slot for a lane that has not reported yet.
    pub fn pending(lane_index: usize) -> Self {
        Self {
            lane_index,
            ..Default::default()
        }
    }

    /// Successful detection.
    pub fn counted(lane_index: usize, count: u64) -> Self {
        Self {
            lane_index,
            count: Some(count),
            ..Default::default()
        }
    }

    /// Failed detection.
    pub fn failed(lane_index: usize, error: impl Into<String>) -> Self {
        Self {
            lane_index,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_elapsed_ms(mut self, elapsed_ms: u64) -> Self {
        self.elapsed_ms = elapsed_ms;
        self
    }

    /// Returns true if the worker reported either a count or an error.
    pub fn is_complete(&self) -> bool {
        self.count.is_some() || self.error.is_some()
    }

    /// The error the caller should act on, treating a missing report as one.
    pub fn failure(&self) -> Option<&str> {
        match (&self.count, &self.error) {
            (_, Some(e)) => Some(e.as_str()),
            (None, None) => Some("No result collected"),
            (Some(_), None) => None,
        }
    }
}

/// A lane-level failure as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneError {
    pub index: usize,
    pub error: String,
}
