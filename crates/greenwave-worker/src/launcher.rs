//! Worker spawn strategies.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use greenwave_core::{DetectionError, DetectionTask};
use tokio::process::{Child, Command};
use tracing::debug;

/// Environment variables a detector keeps by default; everything else is cleared.
pub const DEFAULT_ENV_PASSTHROUGH: &[&str] = &["PATH", "HOME", "LANG", "LC_ALL", "TMPDIR"];

/// Extension point for how a detection worker process is started.
///
/// The returned child must have stdout and stderr piped. The pool owns it from
/// then on: it collects the report, enforces deadlines and reaps the process.
pub trait WorkerLauncher: Send + Sync {
    fn spawn(&self, task: &DetectionTask) -> Result<Child, DetectionError>;
}

/// Launches an external detector executable with the video path as its last
/// argument.
///
/// Each worker starts from a clean environment: only the allow-listed
/// variables are inherited, stdin is closed, and the child is killed if its
/// handle is dropped.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    /// Detector executable.
    program: PathBuf,

    /// Arguments placed before the video path.
    args: Vec<String>,

    /// Inherited variable names.
    env_passthrough: Vec<String>,

    /// Variables set explicitly.
    env_vars: Vec<(String, String)>,

    /// Working directory for the detector, if not the current one.
    working_dir: Option<PathBuf>,
}

impl CommandLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env_passthrough: DEFAULT_ENV_PASSTHROUGH
                .iter()
                .map(|s| s.to_string())
                .collect(),
            env_vars: Vec::new(),
            working_dir: None,
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

    /// Inherit one more variable from the parent environment.
    pub fn with_env_passthrough(mut self, key: impl Into<String>) -> Self {
        self.env_passthrough.push(key.into());
        self
    }

    /// Set an environment variable for every worker.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Build the command for one task without spawning it.
    pub fn command(&self, task: &DetectionTask) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(&task.video_path)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for key in &self.env_passthrough {
            if let Some(value) = std::env::var_os(key) {
                cmd.env(key, value);
            }
        }
        for (key, value) in &self.env_vars {
            cmd.env(key, value);
        }
        cmd.env("GREENWAVE_LANE", task.lane_index.to_string());

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        cmd
    }
}

impl WorkerLauncher for CommandLauncher {
    fn spawn(&self, task: &DetectionTask) -> Result<Child, DetectionError> {
        let mut cmd = self.command(task);
        debug!(lane = task.lane_index, "Spawning detection worker: {:?}", cmd);
        cmd.spawn().map_err(|e| {
            DetectionError::Spawn(format!("{}: {}", self.program.display(), e))
        })
    }
}

/// Launcher used when no detector executable is configured. Every lane
/// fails to start with a message naming the missing setting.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDetector;

impl WorkerLauncher for NoDetector {
    fn spawn(&self, _task: &DetectionTask) -> Result<Child, DetectionError> {
        Err(DetectionError::Spawn(
            "no detector configured (set detector_program)".to_string(),
        ))
    }
}
