//! Run history collaborator.
//!
//! Completed batches are handed to a `RunRecorder` after the response is
//! built. Recording is fire-and-report: a failure is logged and the response
//! is returned unchanged.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use greenwave_core::{OptimizerResult, RecommendationOutcome, RecordError, LANE_COUNT};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// One completed batch, as handed to the recorder.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord<'a> {
    pub counts: [u64; LANE_COUNT],
    pub optimizer: &'a OptimizerResult,
    pub recommendation: &'a RecommendationOutcome,
    pub delay: Option<f64>,
    pub elapsed_seconds: f64,
}

/// Persists completed runs.
#[async_trait]
pub trait RunRecorder: Send + Sync {
    async fn record(&self, run: &RunRecord<'_>) -> Result<(), RecordError>;
}

/// Appends one JSON object per run to a file.
#[derive(Debug, Clone)]
pub struct JsonLinesRecorder {
    path: PathBuf,
}

impl JsonLinesRecorder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Serialize)]
struct Line<'a> {
    recorded_at: u64,
    #[serde(flatten)]
    run: &'a RunRecord<'a>,
}

#[async_trait]
impl RunRecorder for JsonLinesRecorder {
    async fn record(&self, run: &RunRecord<'_>) -> Result<(), RecordError> {
        let recorded_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mut line = serde_json::to_vec(&Line { recorded_at, run })?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;

        debug!(path = %self.path.display(), "Run recorded");
        Ok(())
    }
}
