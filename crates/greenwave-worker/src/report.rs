//! Decoding a detection worker's report.
//!
//! A worker prints its result as the last non-empty line of stdout, either as
//! JSON (`{"count": 17}` / `{"error": "..."}`) or as a bare integer. Earlier
//! lines are progress output and are ignored.

use greenwave_core::DetectionError;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
struct WorkerReport {
    #[serde(default)]
    count: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Extract the vehicle count from worker stdout.
pub fn parse_report(stdout: &str) -> Result<u64, DetectionError> {
    let line = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| DetectionError::InvalidOutput("worker printed nothing".to_string()))?;

    if let Ok(count) = line.parse::<u64>() {
        return Ok(count);
    }

    let value: Value = serde_json::from_str(line)
        .map_err(|_| DetectionError::InvalidOutput(preview(line)))?;

    if let Value::Object(_) = value {
        let report: WorkerReport = serde_json::from_value(value)
            .map_err(|e| DetectionError::InvalidOutput(e.to_string()))?;
        if let Some(error) = report.error.filter(|e| !e.is_empty()) {
            return Err(DetectionError::Failed(error));
        }
        return match report.count {
            Some(count) => count_from_value(&count),
            None => Err(DetectionError::InvalidOutput(
                "report has neither count nor error".to_string(),
            )),
        };
    }

    count_from_value(&value)
}

/// Peak-mean style detectors report fractional counts; those are rounded.
fn count_from_value(value: &Value) -> Result<u64, DetectionError> {
    if let Some(n) = value.as_u64() {
        return Ok(n);
    }
    match value.as_f64() {
        Some(f) if f.is_finite() && f >= 0.0 => Ok(f.round() as u64),
        _ => Err(DetectionError::InvalidOutput(format!(
            "{} is not a vehicle count",
            value
        ))),
    }
}

fn preview(line: &str) -> String {
    line.chars().take(200).collect()
}
