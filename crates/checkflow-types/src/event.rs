//! Event types published by the workflow engine.
//!
//! `WorkflowEvent` is the unified event type delivered to subscribers (CLI,
//! TUI, logging). All variants are Clone + Send + Sync so they can also be
//! fanned out over a tokio broadcast channel.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::{Progress, Summary, WorkflowState, WorkflowStatus};
use crate::template::Step;

/// Events emitted by the workflow engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// `init` finished and the engine is ready.
    Initialized {
        template_id: String,
        instance_id: Option<Uuid>,
        status: WorkflowStatus,
    },

    /// The current step changed. `step` is `None` when the run finished.
    StepChanged {
        step: Option<Step>,
        index: usize,
    },

    StepCompleted {
        step: Step,
        duration_ms: Option<i64>,
    },

    StepSkipped {
        step: Step,
        reason: Option<String>,
    },

    ProgressUpdated { progress: Progress },

    WorkflowCompleted { summary: Summary },

    WorkflowReset {
        template_id: String,
        instance_id: Option<Uuid>,
    },

    /// Full state snapshot after a change that is not a step move.
    StateChanged { state: Box<WorkflowState> },

    ValidationFailed { step_id: String, error: String },

    RecoveryStarted,

    RecoveryCompleted { recovered: usize },

    Error {
        code: String,
        message: String,
        recoverable: bool,
        context: serde_json::Value,
    },
}

impl WorkflowEvent {
    pub fn name(&self) -> EventName {
        match self {
            WorkflowEvent::Initialized { .. } => EventName::Initialized,
            WorkflowEvent::StepChanged { .. } => EventName::StepChanged,
            WorkflowEvent::StepCompleted { .. } => EventName::StepCompleted,
            WorkflowEvent::StepSkipped { .. } => EventName::StepSkipped,
            WorkflowEvent::ProgressUpdated { .. } => EventName::ProgressUpdated,
            WorkflowEvent::WorkflowCompleted { .. } => EventName::WorkflowCompleted,
            WorkflowEvent::WorkflowReset { .. } => EventName::WorkflowReset,
            WorkflowEvent::StateChanged { .. } => EventName::StateChanged,
            WorkflowEvent::ValidationFailed { .. } => EventName::ValidationFailed,
            WorkflowEvent::RecoveryStarted => EventName::RecoveryStarted,
            WorkflowEvent::RecoveryCompleted { .. } => EventName::RecoveryCompleted,
            WorkflowEvent::Error { .. } => EventName::Error,
        }
    }
}

/// Subscription key for the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventName {
    Initialized,
    StepChanged,
    StepCompleted,
    StepSkipped,
    ProgressUpdated,
    WorkflowCompleted,
    WorkflowReset,
    StateChanged,
    ValidationFailed,
    RecoveryStarted,
    RecoveryCompleted,
    Error,
}

impl EventName {
    /// Wire name, e.g. `step:changed`.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::Initialized => "initialized",
            EventName::StepChanged => "step:changed",
            EventName::StepCompleted => "step:completed",
            EventName::StepSkipped => "step:skipped",
            EventName::ProgressUpdated => "progress:updated",
            EventName::WorkflowCompleted => "workflow:completed",
            EventName::WorkflowReset => "workflow:reset",
            EventName::StateChanged => "state:changed",
            EventName::ValidationFailed => "validation:failed",
            EventName::RecoveryStarted => "recovery:started",
            EventName::RecoveryCompleted => "recovery:completed",
            EventName::Error => "error",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        let event = WorkflowEvent::StepChanged {
            step: None,
            index: 3,
        };
        assert_eq!(event.name(), EventName::StepChanged);
        assert_eq!(event.name().as_str(), "step:changed");
        assert_eq!(EventName::ProgressUpdated.to_string(), "progress:updated");
        assert_eq!(WorkflowEvent::RecoveryStarted.name().as_str(), "recovery:started");
    }

    #[test]
    fn test_event_serde_is_tagged() {
        let event = WorkflowEvent::RecoveryCompleted { recovered: 2 };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"recovery_completed\""));
        let parsed: WorkflowEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, WorkflowEvent::RecoveryCompleted { recovered: 2 }));
    }
}
