//! Step visibility and navigation.
//!
//! Every function here takes the template and a `WorkflowState` by value and
//! returns the next state; nothing is mutated in place and nothing is
//! persisted. The engine runs these inside a transaction and decides what to
//! write.
//!
//! Visibility is recomputed on every call. A step with no condition (or a
//! blank one) is always visible; otherwise it is visible iff its condition
//! evaluates to `true` against [`build_context`].

use chrono::{DateTime, Utc};

use checkflow_types::error::WorkflowError;
use checkflow_types::state::{
    CompletedStep, SkippedStep, StepResult, WorkflowState, WorkflowStatus,
    validate_state_transition,
};
use checkflow_types::template::{ChecklistTemplate, Step};
use checkflow_types::value::{Value, Variables};

use crate::condition::ConditionEvaluator;

/// Result of a navigation function.
#[derive(Debug, Clone)]
pub struct NavigationOutcome {
    pub state: WorkflowState,
    pub result: StepResult,
    /// Completion recorded by this move, if any.
    pub completed: Option<CompletedStep>,
    /// Explicit skip recorded by this move, if any.
    pub skipped: Option<SkippedStep>,
    /// The move consumed the last visible step.
    pub finished: bool,
}

impl NavigationOutcome {
    fn unchanged(state: WorkflowState, result: StepResult) -> Self {
        Self {
            state,
            result,
            completed: None,
            skipped: None,
            finished: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Context and visibility
// ---------------------------------------------------------------------------

/// Variables visible to step conditions.
///
/// The workflow variables plus the derived, read-only fields
/// `completedCount`, `skippedCount`, `currentStepIndex`, `totalSteps` and
/// `status`. Derived fields shadow variables of the same name.
pub fn build_context(template: &ChecklistTemplate, state: &WorkflowState) -> Variables {
    let mut context = state.variables.clone();
    context.insert(
        "completedCount".to_string(),
        Value::from(state.completed_steps.len()),
    );
    context.insert(
        "skippedCount".to_string(),
        Value::from(state.skipped_steps.len()),
    );
    context.insert(
        "currentStepIndex".to_string(),
        Value::from(state.current_step_index),
    );
    context.insert("totalSteps".to_string(), Value::from(template.steps.len()));
    context.insert("status".to_string(), Value::from(state.status.to_string()));
    context
}

/// Navigation over one template's steps.
#[derive(Debug, Clone, Default)]
pub struct Navigator {
    evaluator: ConditionEvaluator,
}

impl Navigator {
    pub fn new(evaluator: ConditionEvaluator) -> Self {
        Self { evaluator }
    }

    pub fn evaluator(&self) -> &ConditionEvaluator {
        &self.evaluator
    }

    fn visible_in(&self, step: &Step, context: &Variables) -> bool {
        match step.condition.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(condition) => self.evaluator.evaluate(condition, context),
        }
    }

    pub fn is_step_visible(
        &self,
        template: &ChecklistTemplate,
        state: &WorkflowState,
        index: usize,
    ) -> bool {
        template
            .steps
            .get(index)
            .is_some_and(|step| self.visible_in(step, &build_context(template, state)))
    }

    /// First visible index at or after `from`.
    pub fn first_visible_index(
        &self,
        template: &ChecklistTemplate,
        state: &WorkflowState,
        from: usize,
    ) -> Option<usize> {
        let context = build_context(template, state);
        (from..template.steps.len()).find(|&i| self.visible_in(&template.steps[i], &context))
    }

    /// First visible index after the current one.
    pub fn next_visible_index(
        &self,
        template: &ChecklistTemplate,
        state: &WorkflowState,
    ) -> Option<usize> {
        self.first_visible_index(template, state, state.current_step_index + 1)
    }

    /// Nearest visible index before the current one.
    pub fn previous_visible_index(
        &self,
        template: &ChecklistTemplate,
        state: &WorkflowState,
    ) -> Option<usize> {
        let context = build_context(template, state);
        let upper = state.current_step_index.min(template.steps.len());
        (0..upper)
            .rev()
            .find(|&i| self.visible_in(&template.steps[i], &context))
    }

    // -----------------------------------------------------------------------
    // Moves
    // -----------------------------------------------------------------------

    /// Place an idle state on its first visible step.
    ///
    /// A template with no visible steps completes immediately
    /// (`idle -> active -> completed`). Non-idle states are returned as-is.
    pub fn settle(
        &self,
        template: &ChecklistTemplate,
        mut state: WorkflowState,
    ) -> Result<NavigationOutcome, WorkflowError> {
        if state.status != WorkflowStatus::Idle {
            let step = template.steps.get(state.current_step_index).cloned();
            return Ok(NavigationOutcome::unchanged(state, StepResult::ok(step)));
        }

        match self.first_visible_index(template, &state, state.current_step_index) {
            Some(index) => {
                state.current_step_index = index;
                let step = template.steps[index].clone();
                Ok(NavigationOutcome::unchanged(state, StepResult::ok(Some(step))))
            }
            None => {
                let now = Utc::now();
                activate(&mut state, now)?;
                finish(template, &mut state, now)?;
                Ok(NavigationOutcome {
                    state,
                    result: StepResult::ok(None),
                    completed: None,
                    skipped: None,
                    finished: true,
                })
            }
        }
    }

    /// Complete the current step and move to the next visible one.
    ///
    /// Steps passed over because their condition is false are not recorded
    /// anywhere. When nothing visible remains the workflow completes, the
    /// index moves past the end and the result carries no step.
    pub fn advance(
        &self,
        template: &ChecklistTemplate,
        mut state: WorkflowState,
    ) -> Result<NavigationOutcome, WorkflowError> {
        ensure_can_move(&state, "advance")?;
        let now = Utc::now();
        activate(&mut state, now)?;

        let completed = match template.steps.get(state.current_step_index) {
            Some(step) => {
                let record = CompletedStep {
                    step: step.clone(),
                    completed_at: now,
                    duration_ms: state
                        .last_activity_at()
                        .map(|since| (now - since).num_milliseconds().max(0)),
                };
                forget_step(&mut state, &step.id);
                state.completed_steps.push(record.clone());
                Some(record)
            }
            None => None,
        };

        let mut outcome = self.move_forward(template, state, now)?;
        outcome.completed = completed;
        Ok(outcome)
    }

    /// Record an explicit skip of the current step and move forward.
    pub fn skip(
        &self,
        template: &ChecklistTemplate,
        mut state: WorkflowState,
        reason: impl Into<String>,
    ) -> Result<NavigationOutcome, WorkflowError> {
        ensure_can_move(&state, "skip")?;
        let now = Utc::now();
        activate(&mut state, now)?;

        let skipped = match template.steps.get(state.current_step_index) {
            Some(step) => {
                let record = SkippedStep {
                    step: step.clone(),
                    reason: Some(reason.into()),
                    timestamp: now,
                };
                forget_step(&mut state, &step.id);
                state.skipped_steps.push(record.clone());
                Some(record)
            }
            None => None,
        };

        let mut outcome = self.move_forward(template, state, now)?;
        outcome.skipped = skipped;
        Ok(outcome)
    }

    /// Move to the nearest visible predecessor.
    ///
    /// Every completion and skip at or beyond the target index is removed so
    /// re-entered steps are undone. With no visible predecessor the state is
    /// returned unchanged and the result reports failure.
    pub fn go_back(
        &self,
        template: &ChecklistTemplate,
        mut state: WorkflowState,
    ) -> Result<NavigationOutcome, WorkflowError> {
        match state.status {
            WorkflowStatus::Paused => {
                return Err(WorkflowError::InvalidOperation(
                    "cannot go back while paused; resume first".to_string(),
                ));
            }
            WorkflowStatus::Completed | WorkflowStatus::Failed => {
                return Err(WorkflowError::StateTransition {
                    from: state.status,
                    to: WorkflowStatus::Active,
                });
            }
            WorkflowStatus::Idle | WorkflowStatus::Active => {}
        }

        let Some(target) = self.previous_visible_index(template, &state) else {
            let current = template.steps.get(state.current_step_index).cloned();
            return Ok(NavigationOutcome::unchanged(
                state,
                StepResult::failed(current, "no previous visible step"),
            ));
        };

        let before_target = |id: &str| template.index_of(id).is_some_and(|i| i < target);
        state.completed_steps.retain(|c| before_target(&c.step.id));
        state.skipped_steps.retain(|s| before_target(&s.step.id));
        state.current_step_index = target;

        let step = template.steps[target].clone();
        Ok(NavigationOutcome::unchanged(state, StepResult::ok(Some(step))))
    }

    fn move_forward(
        &self,
        template: &ChecklistTemplate,
        mut state: WorkflowState,
        now: DateTime<Utc>,
    ) -> Result<NavigationOutcome, WorkflowError> {
        match self.next_visible_index(template, &state) {
            Some(next) => {
                state.current_step_index = next;
                let step = template.steps[next].clone();
                Ok(NavigationOutcome::unchanged(state, StepResult::ok(Some(step))))
            }
            None => {
                finish(template, &mut state, now)?;
                Ok(NavigationOutcome {
                    state,
                    result: StepResult::ok(None),
                    completed: None,
                    skipped: None,
                    finished: true,
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn ensure_can_move(state: &WorkflowState, operation: &str) -> Result<(), WorkflowError> {
    match state.status {
        WorkflowStatus::Idle | WorkflowStatus::Active => Ok(()),
        WorkflowStatus::Paused => Err(WorkflowError::InvalidOperation(format!(
            "cannot {operation} while paused; resume first"
        ))),
        WorkflowStatus::Completed | WorkflowStatus::Failed => {
            Err(WorkflowError::StateTransition {
                from: state.status,
                to: WorkflowStatus::Active,
            })
        }
    }
}

fn activate(state: &mut WorkflowState, now: DateTime<Utc>) -> Result<(), WorkflowError> {
    if state.status == WorkflowStatus::Idle {
        validate_state_transition(state.status, WorkflowStatus::Active)?;
        state.status = WorkflowStatus::Active;
        state.started_at.get_or_insert(now);
    }
    Ok(())
}

fn finish(
    template: &ChecklistTemplate,
    state: &mut WorkflowState,
    now: DateTime<Utc>,
) -> Result<(), WorkflowError> {
    validate_state_transition(state.status, WorkflowStatus::Completed)?;
    state.status = WorkflowStatus::Completed;
    state.current_step_index = template.steps.len();
    state.completed_at = Some(now);
    Ok(())
}

/// Drop any earlier record of `step_id` so a step appears at most once.
fn forget_step(state: &mut WorkflowState, step_id: &str) {
    state.completed_steps.retain(|c| c.step.id != step_id);
    state.skipped_steps.retain(|s| s.step.id != step_id);
}
