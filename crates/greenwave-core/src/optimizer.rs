//! Optimizer invocation, log event and result types.

use std::time::Duration;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::OptimizerError;
use crate::{Lane, LANE_COUNT};

/// Input to one optimizer run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimizerInvocation {
    /// Car counts in lane order: north, south, west, east.
    pub cars: [u64; LANE_COUNT],

    /// Pass `--verbose` so the optimizer logs its trajectory to stderr.
    pub verbose: bool,

    /// Wall-clock deadline for the child process.
    pub timeout: Duration,
}

impl OptimizerInvocation {
    /// Create a new invocation from already-validated counts.
    pub fn new(cars: [u64; LANE_COUNT], timeout: Duration, verbose: bool) -> Self {
        Self {
            cars,
            verbose,
            timeout,
        }
    }

    /// Build an invocation from untyped input such as a JSON request body.
    ///
    /// Accepts non-negative integers, integral floats (`12.0`) and numeric
    /// strings (`"12"`). Anything else fails with `InvalidInput`.
    pub fn from_values(
        values: &[Value],
        timeout: Duration,
        verbose: bool,
    ) -> Result<Self, OptimizerError> {
        if values.len() != LANE_COUNT {
            return Err(OptimizerError::InvalidInput(format!(
                "expected {} car counts, got {}",
                LANE_COUNT,
                values.len()
            )));
        }

        let mut cars = [0u64; LANE_COUNT];
        for (i, value) in values.iter().enumerate() {
            cars[i] = coerce_count(value)
                .map_err(|e| OptimizerError::InvalidInput(format!("lane {}: {}", i, e)))?;
        }

        Ok(Self::new(cars, timeout, verbose))
    }

    /// Command-line arguments for the optimizer, excluding the program itself.
    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = self.cars.iter().map(|c| c.to_string()).collect();
        if self.verbose {
            args.push("--verbose".to_string());
        }
        args
    }
}

fn coerce_count(value: &Value) -> Result<u64, String> {
    match value {
        Value::Number(n) => {
            if let Some(v) = n.as_u64() {
                return Ok(v);
            }
            match n.as_f64() {
                Some(f) if f.is_finite() && f >= 0.0 && f.fract() == 0.0 && f <= u64::MAX as f64 => {
                    Ok(f as u64)
                }
                _ => Err(format!("{} is not a non-negative integer", n)),
            }
        }
        Value::String(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| format!("'{}' is not a non-negative integer", s)),
        other => Err(format!("{} is not a number", other)),
    }
}

/// Whether an iteration improved on the best solution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IterationKind {
    #[serde(rename = "new_best")]
    NewBest,
    #[serde(rename = "best_unchanged")]
    Unchanged,
}

/// One structured line of optimizer log output.
///
/// Order matters: a sequence of these reconstructs the optimizer's trajectory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEvent {
    /// The counts the optimizer was started with.
    Invocation { cars: Vec<u64> },

    /// GA parameters.
    Start {
        pop_size: u64,
        max_iter: u64,
        green_min: u64,
        green_max: u64,
        cycle_time: u64,
    },

    /// Delay of the initial best individual.
    StartingBest { best_delay: f64 },

    #[serde(rename = "iter")]
    Iteration {
        iter: u64,
        #[serde(rename = "event")]
        kind: IterationKind,
        best_delay: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        greens: Option<Vec<u64>>,
    },

    /// Final allocation, north/south/west/east.
    End { final_greens: [u64; LANE_COUNT] },
}

/// What the optimizer wrote to stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum StdoutPayload {
    /// A JSON object; its fields are merged into the result.
    Fields(Map<String, Value>),
    /// Valid JSON that is not an object; exposed under `result`.
    Value(Value),
    /// Output that did not parse; exposed under `raw_stdout`.
    Raw(String),
}

impl StdoutPayload {
    /// Classify trimmed stdout. Empty output is an empty object.
    pub fn parse(stdout: &str) -> Self {
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return Self::Fields(Map::new());
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Object(map)) => Self::Fields(map),
            Ok(other) => Self::Value(other),
            Err(_) => Self::Raw(trimmed.to_string()),
        }
    }
}

/// Structured result of one optimizer run.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerResult {
    pub payload: StdoutPayload,

    /// Parsed log events in emission order.
    pub events: Vec<LogEvent>,

    /// Log lines that matched no known pattern, trimmed, in order.
    pub unparsed_lines: Vec<String>,

    /// The retained stderr lines joined with newlines.
    pub raw_log_tail: String,

    /// Set whenever the run failed. Always set for a non-zero exit.
    pub error: Option<String>,

    pub exit_code: Option<i32>,
}

impl OptimizerResult {
    /// A result with the given payload and no log data.
    pub fn from_payload(payload: StdoutPayload) -> Self {
        Self {
            payload,
            events: Vec::new(),
            unparsed_lines: Vec::new(),
            raw_log_tail: String::new(),
            error: None,
            exit_code: None,
        }
    }

    /// Record a non-zero exit.
    pub fn mark_failed(&mut self, exit_code: i32) {
        self.error = Some("optimizer returned non-zero exit code".to_string());
        self.exit_code = Some(exit_code);
    }

    /// A field of the stdout object, if stdout was an object.
    pub fn field(&self, key: &str) -> Option<&Value> {
        match &self.payload {
            StdoutPayload::Fields(map) => map.get(key),
            _ => None,
        }
    }

    /// The error to report, including one the optimizer put in its own output.
    pub fn error(&self) -> Option<&str> {
        self.error
            .as_deref()
            .or_else(|| self.field("error").and_then(Value::as_str))
    }

    pub fn is_error(&self) -> bool {
        self.error().is_some()
    }

    /// The optimized delay, when the optimizer reported one.
    pub fn delay(&self) -> Option<f64> {
        self.field("delay").and_then(Value::as_f64)
    }

    /// Green times keyed north/south/west/east, or the final log event.
    pub fn greens(&self) -> Option<[u64; LANE_COUNT]> {
        let mut greens = [0u64; LANE_COUNT];
        let mut found = true;
        for lane in Lane::ALL {
            match self.field(lane.as_str()).and_then(Value::as_u64) {
                Some(g) => greens[lane.index()] = g,
                None => {
                    found = false;
                    break;
                }
            }
        }
        if found {
            return Some(greens);
        }

        self.events.iter().rev().find_map(|e| match e {
            LogEvent::End { final_greens } => Some(*final_greens),
            _ => None,
        })
    }

    /// The failure this result represents, if any: a non-zero exit first,
    /// then an `error` field printed on stdout.
    pub fn failure(&self) -> Option<OptimizerError> {
        match self.exit_code {
            Some(code) if code != 0 => Some(OptimizerError::NonZeroExit { exit_code: code }),
            _ => self
                .error()
                .map(|e| OptimizerError::Reported(e.to_string())),
        }
    }

    /// Convert into an error when the run failed.
    pub fn into_checked(self) -> Result<Self, OptimizerError> {
        match self.failure() {
            Some(e) => Err(e),
            None => Ok(self),
        }
    }

    /// Flatten into one JSON object: stdout fields plus the log fields.
    pub fn to_json(&self) -> Value {
        let mut map = match &self.payload {
            StdoutPayload::Fields(fields) => fields.clone(),
            StdoutPayload::Value(value) => {
                let mut m = Map::new();
                m.insert("result".to_string(), value.clone());
                m
            }
            StdoutPayload::Raw(raw) => {
                let mut m = Map::new();
                m.insert("raw_stdout".to_string(), Value::String(raw.clone()));
                m
            }
        };

        map.insert(
            "events".to_string(),
            serde_json::to_value(&self.events).unwrap_or_else(|_| Value::Array(Vec::new())),
        );
        map.insert(
            "unparsed_lines".to_string(),
            Value::from(self.unparsed_lines.clone()),
        );
        map.insert(
            "raw_log_tail".to_string(),
            Value::String(self.raw_log_tail.clone()),
        );

        if let Some(error) = &self.error {
            map.insert("error".to_string(), Value::String(error.clone()));
        }
        if let Some(code) = self.exit_code {
            map.insert("exit_code".to_string(), Value::from(code));
        }

        Value::Object(map)
    }
}

impl Serialize for OptimizerResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}
