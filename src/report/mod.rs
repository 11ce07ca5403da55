//! Result aggregation and deterministic report rendering.
//!
//! Results arrive in completion order; [`BatchSummary::from_results`] imposes
//! the only total order (by display name) before anything is rendered.

mod filter;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

pub use filter::{OutputFilter, SSH_NOISE_PATTERNS};

use crate::executor::{ExecutionResult, FailureKind, Outcome};
use crate::policy;

/// How per-target output is laid out.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum OutputMode {
    /// Every line carries a `[display_name]` prefix.
    #[default]
    Prefixed,
    /// Each target's output is emitted contiguously under a header.
    Grouped,
}

impl OutputMode {
    /// Returns the configuration spelling of the mode.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Prefixed => "prefixed",
            Self::Grouped => "grouped",
        }
    }
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when an output mode string is not recognised.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("unknown output mode '{value}'; expected 'prefixed' or 'grouped'")]
pub struct ParseOutputModeError {
    /// Rejected input.
    pub value: String,
}

impl FromStr for OutputMode {
    type Err = ParseOutputModeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "prefixed" => Ok(Self::Prefixed),
            "grouped" => Ok(Self::Grouped),
            _ => Err(ParseOutputModeError {
                value: value.to_owned(),
            }),
        }
    }
}

/// One failed target as listed at the end of a report.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FailureLine {
    /// Display name of the failed target.
    pub display_name: String,
    /// Failure classification.
    pub kind: FailureKind,
    /// First line of detail.
    pub detail: String,
}

/// Aggregate of every result in one batch.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BatchSummary {
    /// Number of work items.
    pub total: usize,
    /// Items that finished with [`Outcome::Success`].
    pub succeeded: usize,
    /// Items that failed, timed out, or were cancelled.
    pub failed: usize,
    /// Results sorted by display name, then identifier.
    pub results: Vec<ExecutionResult>,
    /// `true` when no item failed.
    pub overall_success: bool,
    /// Wall-clock time spent on the batch.
    pub elapsed: Duration,
}

impl BatchSummary {
    /// Builds a summary from results in any order.
    #[must_use]
    pub fn from_results(mut results: Vec<ExecutionResult>, elapsed: Duration) -> Self {
        results.sort_by(|left, right| {
            left.display_name
                .cmp(&right.display_name)
                .then_with(|| left.target_id.cmp(&right.target_id))
        });
        let total = results.len();
        let succeeded = results.iter().filter(|result| result.is_success()).count();
        let failed = total - succeeded;
        Self {
            total,
            succeeded,
            failed,
            results,
            overall_success: failed == 0,
            elapsed,
        }
    }

    /// Lists every failed target with its kind and first line of detail.
    #[must_use]
    pub fn failures(&self) -> Vec<FailureLine> {
        self.results
            .iter()
            .filter_map(|result| {
                result.outcome.failure_kind().map(|kind| FailureLine {
                    display_name: result.display_name.clone(),
                    kind,
                    detail: result.first_detail_line(),
                })
            })
            .collect()
    }

    /// Returns the process exit status for this batch.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        policy::exit_code(self.overall_success)
    }

    /// Returns the results in the same order as [`Self::results`] without
    /// their durations, for comparisons across runs.
    #[must_use]
    pub fn without_timings(&self) -> Vec<ExecutionResult> {
        self.results
            .iter()
            .cloned()
            .map(|mut result| {
                result.duration = Duration::ZERO;
                result
            })
            .collect()
    }
}

/// Renders the per-target body of a report in the requested mode.
#[must_use]
pub fn render(summary: &BatchSummary, mode: OutputMode, filter: Option<&OutputFilter>) -> String {
    let mut out = String::new();
    for result in &summary.results {
        match mode {
            OutputMode::Prefixed => out.push_str(&render_prefixed(result, filter)),
            OutputMode::Grouped => out.push_str(&render_grouped(result, filter)),
        }
    }
    out
}

/// Renders one result with every line prefixed by `[display_name]`.
#[must_use]
pub fn render_prefixed(result: &ExecutionResult, filter: Option<&OutputFilter>) -> String {
    let mut out = String::new();
    for line in output_lines(result, filter) {
        out.push_str(&format!("[{}] {line}\n", result.display_name));
    }
    out.push_str(&format!(
        "[{}] {}\n",
        result.display_name,
        status_label(result)
    ));
    out
}

/// Renders one result as a header followed by its output.
#[must_use]
pub fn render_grouped(result: &ExecutionResult, filter: Option<&OutputFilter>) -> String {
    let mut out = format!("=== {} ({}) ===\n", result.display_name, status_label(result));
    for line in output_lines(result, filter) {
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Renders the list of failed targets, or an empty string when none failed.
#[must_use]
pub fn render_failures(summary: &BatchSummary) -> String {
    let failures = summary.failures();
    if failures.is_empty() {
        return String::new();
    }
    let mut out = String::from("Failed targets:\n");
    for failure in failures {
        out.push_str(&format!(
            "  {} [{}] {}\n",
            failure.display_name, failure.kind, failure.detail
        ));
    }
    out
}

/// Renders the one-line totals footer.
#[must_use]
pub fn render_totals(summary: &BatchSummary) -> String {
    format!(
        "{} targets: {} succeeded, {} failed in {:.2}s\n",
        summary.total,
        summary.succeeded,
        summary.failed,
        summary.elapsed.as_secs_f64()
    )
}

fn output_lines<'a>(
    result: &'a ExecutionResult,
    filter: Option<&'a OutputFilter>,
) -> impl Iterator<Item = &'a str> + 'a {
    result
        .stdout
        .lines()
        .chain(result.stderr.lines())
        .filter(move |line| !line.trim().is_empty())
        .filter(move |line| filter.is_none_or(|active| !active.is_noise(line)))
}

fn status_label(result: &ExecutionResult) -> String {
    let secs = result.duration.as_secs_f64();
    match &result.outcome {
        Outcome::Success => format!("ok in {secs:.2}s"),
        Outcome::Failure { kind, .. } => match result.exit_code {
            Some(code) if *kind == FailureKind::RemoteCommand => {
                format!("failed ({kind}, exit {code}) in {secs:.2}s")
            }
            _ => format!("failed ({kind}) in {secs:.2}s"),
        },
        Outcome::TimedOut => format!("timed out after {secs:.2}s"),
        Outcome::Cancelled => String::from("cancelled"),
    }
}
