//! Workflow execution records.
//!
//! These are the plain, serializable results of a workflow run: per-step
//! results, the aggregate outcome with metrics, and the validation report.
//! Callers persist them as JSON or YAML run artifacts.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorDetail;

// ---------------------------------------------------------------------------
// Step results
// ---------------------------------------------------------------------------

/// Lifecycle status of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    NotStarted,
    InProgress,
    Completed,
    Failed,
    Skipped,
    /// Torn down because the run aborted while the step was running.
    Cancelled,
}

impl StepStatus {
    /// Terminal statuses release a step's dependents.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// Outcome of one step execution. Owned by the engine for the run and
/// read-only to callers afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub name: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    /// Every failed attempt in order; the last one is also in `error`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempt_errors: Vec<ErrorDetail>,
    /// Attempts made, including the first.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl StepResult {
    pub fn not_started(step_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            name: name.into(),
            status: StepStatus::NotStarted,
            output: None,
            error: None,
            attempt_errors: Vec::new(),
            attempts: 0,
            started_at: None,
            finished_at: None,
            duration_ms: None,
        }
    }

    /// Stamp the end of execution and derive the duration.
    pub fn finish(&mut self, status: StepStatus) {
        let now = Utc::now();
        self.status = status;
        self.finished_at = Some(now);
        if let Some(started) = self.started_at {
            self.duration_ms = Some((now - started).num_milliseconds().max(0) as u64);
        }
    }
}

/// One entry of the outcome's error list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepErrorRecord {
    pub step_id: String,
    pub optional: bool,
    pub error: ErrorDetail,
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowMetrics {
    pub total_steps: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    /// Duration per executed step, keyed by step ID.
    pub step_durations_ms: BTreeMap<String, u64>,
    pub total_duration_ms: u64,
}

impl WorkflowMetrics {
    pub fn from_results(results: &[StepResult], total_duration_ms: u64) -> Self {
        let mut metrics = Self {
            total_steps: results.len(),
            total_duration_ms,
            ..Default::default()
        };
        for result in results {
            match result.status {
                StepStatus::Completed => metrics.completed += 1,
                StepStatus::Failed => metrics.failed += 1,
                StepStatus::Skipped => metrics.skipped += 1,
                StepStatus::Cancelled => metrics.cancelled += 1,
                StepStatus::NotStarted | StepStatus::InProgress => {}
            }
            if let Some(ms) = result.duration_ms {
                metrics.step_durations_ms.insert(result.step_id.clone(), ms);
            }
        }
        metrics
    }
}

/// Aggregate result of one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowOutcome {
    pub workflow_name: String,
    pub run_id: Uuid,
    /// `false` when a required step failed or the run was aborted.
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Step results in declaration order.
    pub steps: Vec<StepResult>,
    #[serde(default)]
    pub errors: Vec<StepErrorRecord>,
    pub metrics: WorkflowMetrics,
}

impl WorkflowOutcome {
    pub fn step(&self, step_id: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml_ng::Error> {
        serde_yaml_ng::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

// ---------------------------------------------------------------------------
// Validation report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationIssueKind {
    EmptyId,
    DuplicateId,
    SelfDependency,
    UnknownDependency,
    Cycle,
    InvalidTimeout,
    StepRejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub kind: ValidationIssueKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub message: String,
}

/// Structured pass/fail report produced without executing anything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub step_count: usize,
    #[serde(default)]
    pub issues: Vec<ValidationIssue>,
    /// Each detected cycle as a path of step IDs, first ID repeated at the end.
    #[serde(default)]
    pub cycles: Vec<Vec<String>>,
}

impl ValidationReport {
    pub fn has_issue(&self, kind: ValidationIssueKind) -> bool {
        self.issues.iter().any(|i| i.kind == kind)
    }

    /// One line per issue, for error messages.
    pub fn summary(&self) -> String {
        self.issues
            .iter()
            .map(|i| i.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}
