//! Orchestrator configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use greenwave_worker::{PoolConfig, TimeoutPolicy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Orchestrator configuration.
///
/// Every field has a default, so a TOML file only needs the keys it changes.
/// The detector has none: it must be set before `run` can count anything.
///
/// # Detector report protocol
///
/// The detector is started once per lane as
/// `detector_program [detector_args..] <video_path>` with a cleared
/// environment and `GREENWAVE_LANE` set to the lane index. It must exit 0 and
/// print its result as the last non-empty line of stdout, one of:
///
/// - `{"count": 17}` (fractional counts are rounded)
/// - `{"error": "cannot open video"}`
/// - `17`
///
/// Earlier stdout lines are ignored. A non-zero exit fails the lane with the
/// last line of stderr.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Optimizer executable.
    pub optimizer_path: PathBuf,

    /// Optimizer deadline for batch runs (seconds).
    pub optimizer_timeout_secs: u64,

    /// Optimizer deadline for ad-hoc runs on supplied counts (seconds).
    pub adhoc_timeout_secs: u64,

    /// Pass `--verbose` so the optimizer emits its progress log.
    pub verbose: bool,

    /// Detector executable; the video path is appended to `detector_args`.
    pub detector_program: Option<PathBuf>,
    pub detector_args: Vec<String>,

    /// Extra variables the detector inherits besides the default allow-list.
    pub detector_env_passthrough: Vec<String>,

    /// Maximum concurrent detection workers.
    pub max_workers: usize,

    /// Per-lane detection deadline (seconds).
    pub task_timeout_secs: u64,

    /// Whole-batch detection deadline (seconds).
    pub batch_timeout_secs: u64,

    /// Time a worker gets between SIGTERM and kill (seconds).
    pub grace_period_secs: u64,

    pub timeout_policy: TimeoutPolicy,

    /// Recommender executable. No recommendation step when unset.
    pub recommender_program: Option<PathBuf>,
    pub recommender_args: Vec<String>,
    pub recommender_timeout_secs: u64,

    /// Append one JSON line per completed run here. No history when unset.
    pub history_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            optimizer_path: PathBuf::from("./Algo1"),
            optimizer_timeout_secs: 30,
            adhoc_timeout_secs: 20,
            verbose: true,
            detector_program: None,
            detector_args: Vec::new(),
            detector_env_passthrough: Vec::new(),
            max_workers: greenwave_worker::DEFAULT_MAX_WORKERS,
            task_timeout_secs: greenwave_worker::DEFAULT_TASK_TIMEOUT.as_secs(),
            batch_timeout_secs: greenwave_worker::DEFAULT_BATCH_TIMEOUT.as_secs(),
            grace_period_secs: greenwave_worker::DEFAULT_GRACE_PERIOD.as_secs(),
            timeout_policy: TimeoutPolicy::default(),
            recommender_program: None,
            recommender_args: Vec::new(),
            recommender_timeout_secs: 10,
            history_path: None,
        }
    }
}

impl Config {
    /// Load from a TOML file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn optimizer_timeout(&self) -> Duration {
        Duration::from_secs(self.optimizer_timeout_secs)
    }

    pub fn adhoc_timeout(&self) -> Duration {
        Duration::from_secs(self.adhoc_timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn recommender_timeout(&self) -> Duration {
        Duration::from_secs(self.recommender_timeout_secs)
    }

    /// Worker pool limits.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_workers: self.max_workers,
            task_timeout: Duration::from_secs(self.task_timeout_secs),
            batch_timeout: Duration::from_secs(self.batch_timeout_secs),
            grace_period: self.grace_period(),
            timeout_policy: self.timeout_policy,
        }
    }
}
