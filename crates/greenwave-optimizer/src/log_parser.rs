//! Classifier for optimizer log lines.
//!
//! The optimizer writes a human-readable trajectory to stderr when run with
//! `--verbose`. Each line is matched against six shapes in a fixed order;
//! the first match wins because some shapes are prefix-compatible with others
//! (`[iter I] new best delay` must be tried before `[iter I] best delay`).
//! Lines matching nothing are kept verbatim so operators can still read them.

use std::sync::OnceLock;

use greenwave_core::{IterationKind, LogEvent, LANE_COUNT};
use regex::{Captures, Regex};

const INVOCATION: &str = r"cars\s*=\s*\[?([0-9,\s]+)\]?";
const START: &str = r"pop_size=(\d+)\s+max_iter=(\d+)\s+green_min=(\d+)\s+green_max=(\d+)\s+cycle_time=(\d+)";
const STARTING_BEST: &str = r"starting best delay\s*=\s*([0-9.]+)";
const ITER_NEW_BEST: &str =
    r"\[iter\s*(\d+)\]\s*new best delay\s*=\s*([0-9.]+)\s*(?:green\s*=\s*\[([0-9,\s]+)\])?";
const ITER_BEST: &str = r"\[iter\s*(\d+)\]\s*best delay\s*=\s*([0-9.]+)";
const FINAL_GREENS: &str = r"Final greens:\s*N=(\d+)\s*S=(\d+)\s*W=(\d+)\s*E=(\d+)";

/// Result of classifying one line.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    Event(LogEvent),
    /// A non-empty line that matched no pattern, trimmed.
    Unparsed(String),
    /// An empty or whitespace-only line.
    Blank,
}

/// Events and leftover text from a block of log lines, both in input order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedLog {
    pub events: Vec<LogEvent>,
    pub unparsed_lines: Vec<String>,
}

/// Stateless line classifier holding its compiled patterns.
#[derive(Debug)]
pub struct LogEventParser {
    invocation: Regex,
    start: Regex,
    starting_best: Regex,
    iter_new_best: Regex,
    iter_best: Regex,
    final_greens: Regex,
}

impl Default for LogEventParser {
    fn default() -> Self {
        Self::new()
    }
}

impl LogEventParser {
    pub fn new() -> Self {
        Self {
            invocation: compile(INVOCATION),
            start: compile(START),
            starting_best: compile(STARTING_BEST),
            iter_new_best: compile(ITER_NEW_BEST),
            iter_best: compile(ITER_BEST),
            final_greens: compile(FINAL_GREENS),
        }
    }

    /// Process-wide parser instance.
    pub fn shared() -> &'static LogEventParser {
        static PARSER: OnceLock<LogEventParser> = OnceLock::new();
        PARSER.get_or_init(LogEventParser::new)
    }

    /// Classify a single log line.
    pub fn classify(&self, line: &str) -> Classified {
        let s = line.trim();
        if s.is_empty() {
            return Classified::Blank;
        }

        match self.match_event(s) {
            Some(event) => Classified::Event(event),
            None => Classified::Unparsed(s.to_string()),
        }
    }

    /// Classify every line, keeping events and leftovers in order.
    pub fn parse_lines<I, S>(&self, lines: I) -> ParsedLog
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parsed = ParsedLog::default();
        for line in lines {
            match self.classify(line.as_ref()) {
                Classified::Event(event) => parsed.events.push(event),
                Classified::Unparsed(text) => parsed.unparsed_lines.push(text),
                Classified::Blank => {}
            }
        }
        parsed
    }

    /// First pattern that both matches and yields valid numbers. A match
    /// whose numbers do not parse falls through to the later patterns.
    fn match_event(&self, s: &str) -> Option<LogEvent> {
        self.match_invocation(s)
            .or_else(|| self.match_start(s))
            .or_else(|| self.match_starting_best(s))
            .or_else(|| self.match_new_best(s))
            .or_else(|| self.match_unchanged(s))
            .or_else(|| self.match_final_greens(s))
    }

    fn match_invocation(&self, s: &str) -> Option<LogEvent> {
        let caps = self.invocation.captures(s)?;
        let cars = parse_int_list(&caps[1])?;
        if cars.is_empty() {
            return None;
        }
        Some(LogEvent::Invocation { cars })
    }

    fn match_start(&self, s: &str) -> Option<LogEvent> {
        let caps = self.start.captures(s)?;
        Some(LogEvent::Start {
            pop_size: int_group(&caps, 1)?,
            max_iter: int_group(&caps, 2)?,
            green_min: int_group(&caps, 3)?,
            green_max: int_group(&caps, 4)?,
            cycle_time: int_group(&caps, 5)?,
        })
    }

    fn match_starting_best(&self, s: &str) -> Option<LogEvent> {
        let caps = self.starting_best.captures(s)?;
        Some(LogEvent::StartingBest {
            best_delay: caps[1].parse().ok()?,
        })
    }

    fn match_new_best(&self, s: &str) -> Option<LogEvent> {
        let caps = self.iter_new_best.captures(s)?;
        let greens = match caps.get(3) {
            Some(m) => Some(parse_int_list(m.as_str())?).filter(|g| !g.is_empty()),
            None => None,
        };
        Some(LogEvent::Iteration {
            iter: int_group(&caps, 1)?,
            kind: IterationKind::NewBest,
            best_delay: caps[2].parse().ok()?,
            greens,
        })
    }

    fn match_unchanged(&self, s: &str) -> Option<LogEvent> {
        let caps = self.iter_best.captures(s)?;
        Some(LogEvent::Iteration {
            iter: int_group(&caps, 1)?,
            kind: IterationKind::Unchanged,
            best_delay: caps[2].parse().ok()?,
            greens: None,
        })
    }

    fn match_final_greens(&self, s: &str) -> Option<LogEvent> {
        let caps = self.final_greens.captures(s)?;
        let mut final_greens = [0u64; LANE_COUNT];
        for (i, slot) in final_greens.iter_mut().enumerate() {
            *slot = int_group(&caps, i + 1)?;
        }
        Some(LogEvent::End { final_greens })
    }
}

/// Classify one line with the shared parser.
pub fn classify(line: &str) -> Classified {
    LogEventParser::shared().classify(line)
}

/// Classify a block of lines with the shared parser.
pub fn parse_lines<I, S>(lines: I) -> ParsedLog
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    LogEventParser::shared().parse_lines(lines)
}

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("log pattern is a valid regex")
}

fn int_group(caps: &Captures<'_>, index: usize) -> Option<u64> {
    caps.get(index)?.as_str().parse().ok()
}

/// Split on commas, trimming each token. Empty tokens are skipped.
fn parse_int_list(text: &str) -> Option<Vec<u64>> {
    text.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| t.parse().ok())
        .collect()
}
