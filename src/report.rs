//! Run/suite/step results and the JSON reporter.
//!
//! Results are created when an executor enters the unit, frozen at
//! termination and never mutated afterwards. The reporter writes
//! `latest.json` plus a timestamped copy into the configured output
//! directory; HTML/JUnit renderers consume the same document elsewhere.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::assertion::AssertionResult;
use crate::suite::Priority;
use crate::{Error, Result};

/// Terminal state of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Step completed and all assertions held
    Success,
    /// Step failed (error or assertion)
    Failure,
    /// Step did not run (condition false, upstream failure)
    Skipped,
    /// Step was cancelled mid-flight
    Cancelled,
}

/// Terminal state of a suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuiteStatus {
    /// Every step succeeded
    Success,
    /// At least one step failed
    Failure,
    /// Never ran (filtered out or upstream failure)
    Skipped,
    /// Aborted by a non-test error
    Error,
    /// Cancelled or timed out
    Cancelled,
}

/// Scenario evaluation record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioMeta {
    /// Scenario label, when declared
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// The condition expression
    pub condition: String,
    /// Whether the condition held
    pub matched: bool,
    /// Whether the scenario's checks/captures ran
    pub executed: bool,
}

/// Frozen record of one step execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// Step name
    pub step_name: String,
    /// Terminal state
    pub status: StepStatus,
    /// Wall-clock duration
    pub duration_ms: u64,
    /// Resolved request spec, when a request ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_details: Option<Value>,
    /// Normalized response, when a request ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_details: Option<Value>,
    /// Assertion outcomes
    #[serde(default)]
    pub assertions_results: Vec<AssertionResult>,
    /// Captures stored by this step
    #[serde(default)]
    pub captured_variables: BTreeMap<String, Value>,
    /// Scenario evaluation records
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenarios_meta: Option<Vec<ScenarioMeta>>,
    /// Terminal error, when failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Attempts consumed by the retry budget
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Per-iteration results, when `iterate` expanded the step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iterations: Option<Vec<StepResult>>,
    /// Call chain, when the step (or a hook) delegated through the call
    /// service
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_stack: Option<Vec<String>>,
}

const fn default_attempts() -> u32 {
    1
}

impl StepResult {
    /// A skeleton result for a step that never ran.
    #[must_use]
    pub fn skipped(step_name: &str, reason: &str) -> Self {
        Self {
            step_name: step_name.to_string(),
            status: StepStatus::Skipped,
            duration_ms: 0,
            request_details: None,
            response_details: None,
            assertions_results: Vec::new(),
            captured_variables: BTreeMap::new(),
            scenarios_meta: None,
            error: Some(reason.to_string()),
            attempts: 0,
            iterations: None,
            call_stack: None,
        }
    }
}

/// Frozen record of one suite execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteResult {
    /// Suite id
    pub node_id: String,
    /// Suite display name
    pub suite_name: String,
    /// Terminal state
    pub status: SuiteStatus,
    /// Scheduling priority
    pub priority: Priority,
    /// Start timestamp
    pub start_time: DateTime<Utc>,
    /// End timestamp
    pub end_time: DateTime<Utc>,
    /// Wall-clock duration
    pub duration_ms: u64,
    /// Steps accounted for (run or skipped)
    pub steps_executed: usize,
    /// Steps that succeeded
    pub steps_successful: usize,
    /// Steps that failed
    pub steps_failed: usize,
    /// Percentage of successful steps
    pub success_rate: f64,
    /// Per-step records
    pub steps_results: Vec<StepResult>,
    /// Abort error, when status is `error`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SuiteResult {
    /// Build a suite result from its step records, deriving the counters.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn from_steps(
        node_id: &str,
        suite_name: &str,
        priority: Priority,
        status: SuiteStatus,
        start_time: DateTime<Utc>,
        steps_results: Vec<StepResult>,
    ) -> Self {
        let end_time = Utc::now();
        let steps_executed = steps_results.len();
        let steps_successful = steps_results
            .iter()
            .filter(|s| s.status == StepStatus::Success)
            .count();
        let steps_failed = steps_results
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Failure | StepStatus::Cancelled))
            .count();
        Self {
            node_id: node_id.to_string(),
            suite_name: suite_name.to_string(),
            status,
            priority,
            start_time,
            end_time,
            duration_ms: (end_time - start_time).num_milliseconds().max(0) as u64,
            steps_executed,
            steps_successful,
            steps_failed,
            success_rate: percentage(steps_successful, steps_executed),
            steps_results,
            error: None,
        }
    }

    /// A result for a suite that never ran.
    #[must_use]
    pub fn skipped(
        node_id: &str,
        suite_name: &str,
        priority: Priority,
        step_names: &[String],
        reason: &str,
    ) -> Self {
        let now = Utc::now();
        let steps_results: Vec<StepResult> = step_names
            .iter()
            .map(|name| StepResult::skipped(name, reason))
            .collect();
        Self {
            node_id: node_id.to_string(),
            suite_name: suite_name.to_string(),
            status: SuiteStatus::Skipped,
            priority,
            start_time: now,
            end_time: now,
            duration_ms: 0,
            steps_executed: steps_results.len(),
            steps_successful: 0,
            steps_failed: 0,
            success_rate: 0.0,
            steps_results,
            error: Some(reason.to_string()),
        }
    }
}

/// Frozen record of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    /// Project label from configuration
    pub project_name: String,
    /// Run id
    pub run_id: String,
    /// Start timestamp
    pub start_time: DateTime<Utc>,
    /// End timestamp
    pub end_time: DateTime<Utc>,
    /// Wall-clock duration
    pub total_duration_ms: u64,
    /// Total steps across all suites
    pub total_tests: usize,
    /// Successful steps
    pub successful_tests: usize,
    /// Failed (or cancelled) steps
    pub failed_tests: usize,
    /// Skipped steps
    pub skipped_tests: usize,
    /// Percentage of successful steps
    pub success_rate: f64,
    /// Per-suite records
    pub suites_results: Vec<SuiteResult>,
}

impl RunResult {
    /// Aggregate suite results into a run record.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn aggregate(
        project_name: &str,
        run_id: &str,
        start_time: DateTime<Utc>,
        suites_results: Vec<SuiteResult>,
    ) -> Self {
        let end_time = Utc::now();
        let mut successful = 0usize;
        let mut failed = 0usize;
        let mut skipped = 0usize;
        for suite in &suites_results {
            for step in &suite.steps_results {
                match step.status {
                    StepStatus::Success => successful += 1,
                    StepStatus::Failure | StepStatus::Cancelled => failed += 1,
                    StepStatus::Skipped => skipped += 1,
                }
            }
        }
        let total = successful + failed + skipped;
        Self {
            project_name: project_name.to_string(),
            run_id: run_id.to_string(),
            start_time,
            end_time,
            total_duration_ms: (end_time - start_time).num_milliseconds().max(0) as u64,
            total_tests: total,
            successful_tests: successful,
            failed_tests: failed,
            skipped_tests: skipped,
            success_rate: percentage(successful, total),
            suites_results,
        }
    }

    /// Whether every accounted step succeeded or was skipped.
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failed_tests == 0
            && !self
                .suites_results
                .iter()
                .any(|s| matches!(s.status, SuiteStatus::Failure | SuiteStatus::Error | SuiteStatus::Cancelled))
    }

    /// Whether any unit was cancelled.
    #[must_use]
    pub fn any_cancelled(&self) -> bool {
        self.suites_results
            .iter()
            .any(|s| s.status == SuiteStatus::Cancelled)
    }
}

#[allow(clippy::cast_precision_loss)]
fn percentage(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        100.0
    } else {
        (part as f64 / whole as f64) * 100.0
    }
}

/// Writes run results as JSON documents.
pub struct Reporter {
    output_dir: PathBuf,
}

impl Reporter {
    /// Reporter writing into the given directory (created on demand).
    #[must_use]
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// Write `latest.json` and a timestamped copy. Returns the
    /// timestamped path.
    ///
    /// # Errors
    ///
    /// IO or serialization failures.
    pub fn write(&self, result: &RunResult) -> Result<PathBuf> {
        fs::create_dir_all(&self.output_dir).map_err(|e| {
            Error::Config(format!(
                "Cannot create report directory {}: {e}",
                self.output_dir.display()
            ))
        })?;

        let json = serde_json::to_string_pretty(result)?;
        let latest = self.output_dir.join("latest.json");
        fs::write(&latest, &json)?;

        let stamped = self.output_dir.join(format!(
            "run-{}.json",
            result.start_time.format("%Y%m%dT%H%M%S%3fZ")
        ));
        fs::write(&stamped, &json)?;

        info!(path = %stamped.display(), "Report written");
        Ok(stamped)
    }

    /// The directory reports land in.
    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}
