//! Workflow state types.
//!
//! `WorkflowState` is the mutable, persisted progress of one checklist run.
//! It is owned by the workflow engine and only ever replaced wholesale inside
//! a committed transaction.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::WorkflowError;
use crate::template::Step;
use crate::value::Variables;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Idle,
    Active,
    Paused,
    Completed,
    Failed,
}

impl WorkflowStatus {
    /// Whether `self -> to` is one of the permitted transitions.
    ///
    /// | from      | to        |
    /// |-----------|-----------|
    /// | idle      | active    |
    /// | active    | completed, failed, paused |
    /// | paused    | active, failed |
    /// | completed | idle      |
    /// | failed    | idle      |
    pub fn can_transition_to(self, to: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        matches!(
            (self, to),
            (Idle, Active)
                | (Active, Completed)
                | (Active, Failed)
                | (Active, Paused)
                | (Paused, Active)
                | (Paused, Failed)
                | (Completed, Idle)
                | (Failed, Idle)
        )
    }

    /// Terminal for navigation purposes (only `reset` leaves these).
    pub fn is_finished(self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed)
    }
}

/// Reject any status change not in the transition table.
pub fn validate_state_transition(
    from: WorkflowStatus,
    to: WorkflowStatus,
) -> Result<(), WorkflowError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(WorkflowError::StateTransition { from, to })
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowStatus::Idle => write!(f, "idle"),
            WorkflowStatus::Active => write!(f, "active"),
            WorkflowStatus::Paused => write!(f, "paused"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "idle" => Ok(WorkflowStatus::Idle),
            "active" => Ok(WorkflowStatus::Active),
            "paused" => Ok(WorkflowStatus::Paused),
            "completed" => Ok(WorkflowStatus::Completed),
            "failed" => Ok(WorkflowStatus::Failed),
            other => Err(format!("invalid workflow status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Step records
// ---------------------------------------------------------------------------

/// A step the operator finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedStep {
    pub step: Step,
    pub completed_at: DateTime<Utc>,
    /// Time spent on the step, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

/// A step the operator explicitly skipped.
///
/// Steps hidden by a false condition are never recorded here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedStep {
    pub step: Step,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// WorkflowState
// ---------------------------------------------------------------------------

/// Persisted progress of a checklist run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    pub status: WorkflowStatus,
    /// Index into `template.steps`; equals `steps.len()` once completed.
    pub current_step_index: usize,
    #[serde(default)]
    pub completed_steps: Vec<CompletedStep>,
    #[serde(default)]
    pub skipped_steps: Vec<SkippedStep>,
    #[serde(default)]
    pub variables: Variables,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<Uuid>,
}

impl WorkflowState {
    /// A fresh, idle state for a new run of `template_id`.
    pub fn new(template_id: impl Into<String>, variables: Variables) -> Self {
        Self {
            status: WorkflowStatus::Idle,
            current_step_index: 0,
            completed_steps: Vec::new(),
            skipped_steps: Vec::new(),
            variables,
            started_at: None,
            completed_at: None,
            template_id: Some(template_id.into()),
            instance_id: Some(Uuid::now_v7()),
        }
    }

    pub fn is_completed_step(&self, step_id: &str) -> bool {
        self.completed_steps.iter().any(|c| c.step.id == step_id)
    }

    pub fn is_skipped_step(&self, step_id: &str) -> bool {
        self.skipped_steps.iter().any(|s| s.step.id == step_id)
    }

    /// Timestamp of the most recent completion or skip, falling back to the
    /// run start. Used to time the step that is current now.
    pub fn last_activity_at(&self) -> Option<DateTime<Utc>> {
        let completed = self.completed_steps.iter().map(|c| c.completed_at);
        let skipped = self.skipped_steps.iter().map(|s| s.timestamp);
        completed.chain(skipped).max().or(self.started_at)
    }

    pub fn progress(&self, total_steps: usize) -> Progress {
        Progress::new(
            self.completed_steps.len(),
            self.skipped_steps.len(),
            total_steps,
        )
    }
}

// ---------------------------------------------------------------------------
// Operation results
// ---------------------------------------------------------------------------

/// Result of a navigation operation (`advance`, `go_back`, `skip`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub success: bool,
    /// The step that is now current, or `None` when the workflow finished.
    pub step: Option<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepResult {
    pub fn ok(step: Option<Step>) -> Self {
        Self {
            success: true,
            step,
            error: None,
        }
    }

    pub fn failed(step: Option<Step>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            step,
            error: Some(error.into()),
        }
    }
}

/// Outcome of running a step's validations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ValidationResult {
    pub fn valid() -> Self {
        Self {
            valid: true,
            error: None,
        }
    }

    pub fn invalid(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(error.into()),
        }
    }

    /// `WorkflowError::Validation` for a failed check of `step_id`.
    pub fn into_result(self, step_id: &str) -> Result<(), WorkflowError> {
        if self.valid {
            return Ok(());
        }
        Err(WorkflowError::Validation {
            step_id: step_id.to_string(),
            message: self.error.unwrap_or_else(|| "unknown error".to_string()),
        })
    }
}

/// Completion counters for progress reporting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub completed: usize,
    pub skipped: usize,
    pub total: usize,
    /// Share of steps completed or skipped, 0-100.
    pub percent: f64,
}

impl Progress {
    pub fn new(completed: usize, skipped: usize, total: usize) -> Self {
        let percent = if total == 0 {
            100.0
        } else {
            (((completed + skipped) as f64 / total as f64) * 100.0).min(100.0)
        };
        Self {
            completed,
            skipped,
            total,
            percent,
        }
    }
}

/// Run summary emitted with `workflow:completed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub template_id: Option<String>,
    pub instance_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Wall-clock duration in milliseconds, when both timestamps exist.
    pub duration_ms: Option<i64>,
    pub completed_steps: usize,
    pub skipped_steps: usize,
    pub total_steps: usize,
    pub status: WorkflowStatus,
}

impl Summary {
    pub fn from_state(state: &WorkflowState, total_steps: usize) -> Self {
        let duration_ms = match (state.started_at, state.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        };
        Self {
            template_id: state.template_id.clone(),
            instance_id: state.instance_id,
            started_at: state.started_at,
            completed_at: state.completed_at,
            duration_ms,
            completed_steps: state.completed_steps.len(),
            skipped_steps: state.skipped_steps.len(),
            total_steps,
            status: state.status,
        }
    }
}
