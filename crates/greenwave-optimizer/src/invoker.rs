//! Optimizer invoker for running the external GA binary.
//!
//! This module provides the main `OptimizerInvoker` type. One call spawns one
//! child process, drains its stdout and stderr concurrently under a wall-clock
//! deadline, and merges the parsed stdout JSON with the parsed stderr log.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use greenwave_core::{OptimizerError, OptimizerInvocation, OptimizerResult, StdoutPayload};
use greenwave_process::{terminate, DEFAULT_GRACE_PERIOD};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::log_parser::LogEventParser;

/// Only this many trailing stderr lines are kept and parsed.
pub const MAX_LOG_LINES: usize = 500;

/// Something that turns four lane counts into a green-time allocation.
#[async_trait]
pub trait Optimizer: Send + Sync {
    async fn optimize(
        &self,
        invocation: &OptimizerInvocation,
    ) -> Result<OptimizerResult, OptimizerError>;
}

/// Invoker for the external optimizer executable.
///
/// # Example
///
/// ```rust,no_run
/// use std::time::Duration;
/// use greenwave_core::OptimizerInvocation;
/// use greenwave_optimizer::OptimizerInvoker;
///
/// async fn run() -> Result<(), Box<dyn std::error::Error>> {
///     let invoker = OptimizerInvoker::new("./Algo1");
///     let invocation = OptimizerInvocation::new([5, 12, 3, 9], Duration::from_secs(30), true);
///
///     let result = invoker.invoke(&invocation).await?;
///     println!("{}", result.to_json());
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct OptimizerInvoker {
    /// Path to the optimizer executable.
    binary_path: PathBuf,

    /// Arguments placed before the car counts (e.g. a script for an interpreter).
    leading_args: Vec<String>,

    /// Trailing stderr lines to keep.
    max_log_lines: usize,

    /// Additional environment variables.
    env_vars: Vec<(String, String)>,

    /// Time between SIGTERM and kill when the deadline expires.
    grace_period: Duration,
}

impl OptimizerInvoker {
    /// Create a new invoker for the executable at `binary_path`.
    pub fn new(binary_path: impl Into<PathBuf>) -> Self {
        Self {
            binary_path: binary_path.into(),
            leading_args: Vec::new(),
            max_log_lines: MAX_LOG_LINES,
            env_vars: Vec::new(),
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    /// Add an argument placed before the car counts.
    pub fn with_leading_arg(mut self, arg: impl Into<String>) -> Self {
        self.leading_args.push(arg.into());
        self
    }

    /// Override how many trailing stderr lines are kept.
    pub fn with_max_log_lines(mut self, max_log_lines: usize) -> Self {
        self.max_log_lines = max_log_lines.max(1);
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn binary_path(&self) -> &Path {
        &self.binary_path
    }

    /// Returns true if the configured executable exists.
    pub fn is_available(&self) -> bool {
        self.binary_path.exists()
    }

    /// Coerce untyped counts and invoke.
    pub async fn invoke_values(
        &self,
        values: &[Value],
        timeout: Duration,
        verbose: bool,
    ) -> Result<OptimizerResult, OptimizerError> {
        let invocation = OptimizerInvocation::from_values(values, timeout, verbose)?;
        self.invoke(&invocation).await
    }

    /// Run the optimizer once.
    ///
    /// A non-zero exit is not an `Err`: the result carries `error` and
    /// `exit_code` alongside whatever the optimizer printed. Use
    /// `OptimizerResult::into_checked` to turn it into one.
    pub async fn invoke(
        &self,
        invocation: &OptimizerInvocation,
    ) -> Result<OptimizerResult, OptimizerError> {
        if !self.binary_path.exists() {
            error!(path = %self.binary_path.display(), "Optimizer binary not found");
            return Err(OptimizerError::BinaryNotFound {
                path: self.binary_path.clone(),
            });
        }

        let args = invocation.args();
        info!(
            binary = %self.binary_path.display(),
            cars = ?invocation.cars,
            verbose = invocation.verbose,
            timeout_secs = invocation.timeout.as_secs_f64(),
            "Invoking optimizer"
        );

        let mut cmd = Command::new(&self.binary_path);
        cmd.args(&self.leading_args)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &self.env_vars {
            cmd.env(key, value);
        }

        debug!("Full command: {:?}", cmd);

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            error!(error = %e, "Failed to spawn optimizer process");
            e
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("optimizer stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("optimizer stderr not captured"))?;

        let max_log_lines = self.max_log_lines;
        let run = tokio::time::timeout(invocation.timeout, async {
            let (status, out, log) = tokio::join!(
                child.wait(),
                read_all(stdout),
                collect_log_tail(stderr, max_log_lines)
            );
            Ok::<_, std::io::Error>((status?, out?, log?))
        })
        .await;

        let (status, stdout_text, log_tail) = match run {
            Ok(collected) => collected?,
            Err(_) => {
                warn!(
                    timeout_secs = invocation.timeout.as_secs_f64(),
                    "Optimizer timed out, terminating process"
                );
                terminate(&mut child, self.grace_period).await;
                return Err(OptimizerError::Timeout {
                    timeout: invocation.timeout,
                });
            }
        };

        let exit_code = status.code().unwrap_or(-1);
        info!(
            exit_code = exit_code,
            success = status.success(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            stderr_lines = log_tail.total_lines,
            "Optimizer process exited"
        );

        if log_tail.total_lines > log_tail.lines.len() {
            debug!(
                dropped = log_tail.total_lines - log_tail.lines.len(),
                "Dropped older optimizer log lines"
            );
        }

        let lines: Vec<String> = log_tail.lines.into_iter().collect();
        let parsed = LogEventParser::shared().parse_lines(&lines);

        let mut result = OptimizerResult::from_payload(StdoutPayload::parse(&stdout_text));
        result.events = parsed.events;
        result.unparsed_lines = parsed.unparsed_lines;
        result.raw_log_tail = lines.join("\n");

        if !status.success() {
            warn!(exit_code = exit_code, "Optimizer returned non-zero exit code");
            result.mark_failed(exit_code);
        }

        Ok(result)
    }
}

#[async_trait]
impl Optimizer for OptimizerInvoker {
    async fn optimize(
        &self,
        invocation: &OptimizerInvocation,
    ) -> Result<OptimizerResult, OptimizerError> {
        self.invoke(invocation).await
    }
}

/// The retained tail of a line stream.
struct LogTail {
    lines: VecDeque<String>,
    total_lines: usize,
}

async fn read_all<R: AsyncRead + Unpin>(mut reader: R) -> std::io::Result<String> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Read lines until EOF, keeping only the last `max_lines`.
async fn collect_log_tail<R: AsyncRead + Unpin>(
    reader: R,
    max_lines: usize,
) -> std::io::Result<LogTail> {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut tail = LogTail {
        lines: VecDeque::new(),
        total_lines: 0,
    };

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }

        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(|c| c == '\n' || c == '\r');
        debug!(stderr = %line, "Optimizer stderr");

        if tail.lines.len() == max_lines {
            tail.lines.pop_front();
        }
        tail.lines.push_back(line.to_string());
        tail.total_lines += 1;
    }

    Ok(tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use greenwave_core::{IterationKind, LogEvent};
    use serde_json::json;
    use tempfile::TempDir;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    /// An invoker that runs `script` through /bin/sh.
    fn stub(dir: &TempDir, script: &str) -> OptimizerInvoker {
        let path = dir.path().join("optimizer.sh");
        std::fs::write(&path, script).unwrap();
        OptimizerInvoker::new("/bin/sh").with_leading_arg(path.to_string_lossy())
    }

    #[test]
    fn test_invoker_builder() {
        let invoker = OptimizerInvoker::new("./Algo1")
            .with_leading_arg("--seed=1")
            .with_max_log_lines(0)
            .with_env("OMP_NUM_THREADS", "1")
            .with_grace_period(secs(1));

        assert_eq!(invoker.binary_path(), Path::new("./Algo1"));
        assert_eq!(invoker.leading_args, vec!["--seed=1".to_string()]);
        assert_eq!(invoker.max_log_lines, 1);
        assert_eq!(invoker.env_vars.len(), 1);
        assert_eq!(invoker.grace_period, secs(1));
    }

    #[tokio::test]
    async fn test_binary_not_found() {
        let invoker = OptimizerInvoker::new("/nonexistent/greenwave/Algo1");
        let invocation = OptimizerInvocation::new([1, 2, 3, 4], secs(5), false);

        let err = invoker.invoke(&invocation).await.unwrap_err();
        assert!(matches!(err, OptimizerError::BinaryNotFound { .. }));
    }

    #[tokio::test]
    async fn test_invalid_values_fail_before_spawn() {
        let invoker = OptimizerInvoker::new("/nonexistent/greenwave/Algo1");
        let values = vec![json!(1), json!("x"), json!(3), json!(4)];

        let err = invoker.invoke_values(&values, secs(5), false).await.unwrap_err();
        assert!(matches!(err, OptimizerError::InvalidInput(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_echo_stub_clean_result() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = stub(&dir, "echo \"{\\\"cars\\\":[$1,$2,$3,$4]}\"\n");
        let invocation = OptimizerInvocation::new([5, 12, 3, 9], secs(10), false);

        let result = invoker.invoke(&invocation).await.unwrap();
        assert!(result.error.is_none());
        assert!(result.exit_code.is_none());
        assert!(result.events.is_empty());
        assert!(result.unparsed_lines.is_empty());
        assert_eq!(result.field("cars"), Some(&json!([5, 12, 3, 9])));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_with_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = stub(&dir, "echo 'not json {'\nexit 7\n");
        let invocation = OptimizerInvocation::new([0, 0, 0, 0], secs(10), false);

        let result = invoker.invoke(&invocation).await.unwrap();
        assert!(result.error.is_some());
        assert_eq!(result.exit_code, Some(7));
        assert_eq!(result.payload, StdoutPayload::Raw("not json {".to_string()));

        let value = result.to_json();
        assert_eq!(value["raw_stdout"], json!("not json {"));
        assert_eq!(value["exit_code"], json!(7));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_with_valid_json_still_errors() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = stub(&dir, "echo '{\"north\":10}'\nexit 2\n");
        let invocation = OptimizerInvocation::new([1, 1, 1, 1], secs(10), false);

        let result = invoker.invoke(&invocation).await.unwrap();
        assert!(result.is_error());
        assert_eq!(result.exit_code, Some(2));
        assert_eq!(result.field("north"), Some(&json!(10)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_verbose_log_is_parsed_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"
[ "$5" = "--verbose" ] || exit 3
echo "Starting with cars = [$1,$2,$3,$4]" >&2
echo "[ga] starting best delay=42.5" >&2
echo "" >&2
echo "[iter 1] new best delay = 40.1  green = [12,10,15,13]" >&2
echo "GA finished. Final best delay = 40.1" >&2
echo "Final greens: N=12 S=10 W=15 E=13" >&2
echo '{"north":12,"south":10,"west":15,"east":13,"delay":40.1}'
"#;
        let invoker = stub(&dir, script);
        let invocation = OptimizerInvocation::new([5, 12, 3, 9], secs(10), true);

        let result = invoker.invoke(&invocation).await.unwrap();
        assert!(!result.is_error());
        assert_eq!(result.events.len(), 4);
        assert_eq!(
            result.events[0],
            LogEvent::Invocation {
                cars: vec![5, 12, 3, 9]
            }
        );
        assert!(matches!(
            result.events[2],
            LogEvent::Iteration {
                kind: IterationKind::NewBest,
                ..
            }
        ));
        assert_eq!(
            result.unparsed_lines,
            vec!["GA finished. Final best delay = 40.1".to_string()]
        );
        assert_eq!(result.greens(), Some([12, 10, 15, 13]));
        assert_eq!(result.delay(), Some(40.1));
        assert_eq!(result.raw_log_tail.lines().count(), 6);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_object_stdout_is_wrapped() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = stub(&dir, "echo '[1,2,3]'\n");
        let invocation = OptimizerInvocation::new([1, 2, 3, 4], secs(10), false);

        let result = invoker.invoke(&invocation).await.unwrap();
        assert_eq!(result.to_json()["result"], json!([1, 2, 3]));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_only_last_lines_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let script = "i=0\nwhile [ $i -lt 20 ]; do echo \"line $i\" >&2; i=$((i+1)); done\necho '{}'\n";
        let invoker = stub(&dir, script).with_max_log_lines(5);
        let invocation = OptimizerInvocation::new([1, 2, 3, 4], secs(10), false);

        let result = invoker.invoke(&invocation).await.unwrap();
        assert_eq!(result.unparsed_lines.len(), 5);
        assert_eq!(result.unparsed_lines[0], "line 15");
        assert_eq!(result.unparsed_lines[4], "line 19");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = stub(&dir, "echo '{\"partial\":true}'\nexec sleep 30\n");
        let invocation = OptimizerInvocation::new([1, 2, 3, 4], Duration::from_millis(300), false);

        let started = Instant::now();
        let err = invoker.invoke(&invocation).await.unwrap_err();
        assert!(matches!(err, OptimizerError::Timeout { .. }));
        assert!(started.elapsed() < secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_process_ignoring_sigterm() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = stub(&dir, "trap '' TERM\nexec sleep 30\n")
            .with_grace_period(Duration::from_millis(300));
        let invocation = OptimizerInvocation::new([1, 2, 3, 4], Duration::from_millis(300), false);

        let started = Instant::now();
        let err = invoker.invoke(&invocation).await.unwrap_err();
        assert!(matches!(err, OptimizerError::Timeout { .. }));
        assert!(started.elapsed() < secs(5));
    }
}
