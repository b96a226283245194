//! Transactional workflow engine.
//!
//! Orchestrates the navigator, the state store and the transaction
//! coordinator behind a small operation set. Every state-changing operation
//! runs through [`WorkflowEngine::execute_with_transaction`]:
//!
//! begin (baseline logged) -> navigator computes the next state -> operation
//! entry logged -> snapshot saved -> commit.
//!
//! Any failure rolls the transaction back and restores the durable snapshot
//! before the error reaches the caller, so the in-memory state only ever
//! reflects committed operations. A `tokio::sync::Mutex` around the session
//! serializes callers; events are published after commit while the lock is
//! still held, so listeners see operations in call order.

use std::path::PathBuf;

use checkflow_types::config::CheckflowConfig;
use checkflow_types::error::WorkflowError;
use checkflow_types::event::WorkflowEvent;
use checkflow_types::state::{
    Progress, StepResult, Summary, ValidationResult, WorkflowState, WorkflowStatus,
    validate_state_transition,
};
use checkflow_types::template::{ChecklistTemplate, Step};
use checkflow_types::transaction::STATE_TARGET;
use checkflow_types::value::Variables;
use tokio::sync::Mutex;

use super::navigator::{NavigationOutcome, Navigator};
use crate::condition::ConditionEvaluator;
use crate::event::EventBus;
use crate::state::{StateRepository, StateStore, TemplateSource};
use crate::transaction::WalLog;
use crate::validation::{StepValidator, ValidationContext, validate_step};

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Engine tunables, usually derived from `CheckflowConfig`.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Reason recorded by `skip(None)`.
    pub default_skip_reason: String,
    /// Directory validators run in.
    pub working_dir: PathBuf,
    pub max_condition_depth: usize,
    /// Broadcast buffer of the event bus.
    pub event_capacity: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from_config(&CheckflowConfig::default(), PathBuf::from("."))
    }
}

impl EngineOptions {
    pub fn from_config(config: &CheckflowConfig, working_dir: PathBuf) -> Self {
        Self {
            default_skip_reason: config.default_skip_reason.clone(),
            working_dir,
            max_condition_depth: config.max_condition_depth,
            event_capacity: 256,
        }
    }
}

/// Template and state of the run the engine was initialized with.
struct Session {
    template: ChecklistTemplate,
    state: WorkflowState,
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Runs one checklist template as a durable, transactional workflow.
pub struct WorkflowEngine<R, L, T, V>
where
    R: StateRepository,
    L: WalLog,
    T: TemplateSource,
    V: StepValidator,
{
    store: StateStore<R, L, T>,
    validator: V,
    navigator: Navigator,
    events: EventBus,
    options: EngineOptions,
    session: Mutex<Option<Session>>,
}

impl<R, L, T, V> WorkflowEngine<R, L, T, V>
where
    R: StateRepository,
    L: WalLog,
    T: TemplateSource,
    V: StepValidator,
{
    pub fn new(store: StateStore<R, L, T>, validator: V, options: EngineOptions) -> Self {
        Self {
            store,
            validator,
            navigator: Navigator::new(ConditionEvaluator::new(options.max_condition_depth)),
            events: EventBus::new(options.event_capacity),
            options,
            session: Mutex::new(None),
        }
    }

    /// Subscribe here for engine events.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn store(&self) -> &StateStore<R, L, T> {
        &self.store
    }

    pub async fn is_initialized(&self) -> bool {
        self.session.lock().await.is_some()
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Recover the WAL, load the template, then load or create its state.
    ///
    /// A persisted state that fails integrity checks is discarded and a
    /// fresh run is started in its place. A template whose steps are all
    /// hidden completes immediately.
    pub async fn init(
        &self,
        template_id: &str,
        variables: Variables,
    ) -> Result<WorkflowState, WorkflowError> {
        let mut session = self.session.lock().await;
        let result = self.init_locked(&mut session, template_id, variables).await;
        self.finish_operation(&mut session, "init", result).await
    }

    /// Complete the current step and move to the next visible one.
    pub async fn advance(&self) -> Result<StepResult, WorkflowError> {
        let mut session = self.session.lock().await;
        let result = self.navigate_locked(&mut session, Move::Advance).await;
        self.finish_operation(&mut session, "advance", result).await
    }

    /// Return to the nearest visible predecessor, undoing later progress.
    pub async fn go_back(&self) -> Result<StepResult, WorkflowError> {
        let mut session = self.session.lock().await;
        let result = self.navigate_locked(&mut session, Move::Back).await;
        self.finish_operation(&mut session, "go_back", result).await
    }

    /// Skip the current step, recording `reason` (or the configured default).
    pub async fn skip(&self, reason: Option<String>) -> Result<StepResult, WorkflowError> {
        let reason = reason.unwrap_or_else(|| self.options.default_skip_reason.clone());
        let mut session = self.session.lock().await;
        let result = self.navigate_locked(&mut session, Move::Skip(reason)).await;
        self.finish_operation(&mut session, "skip", result).await
    }

    /// Start a new run of the same template with the same variables.
    ///
    /// Allowed from any status: the previous run is replaced, not
    /// transitioned, and the new run gets a fresh instance id.
    pub async fn reset(&self) -> Result<WorkflowState, WorkflowError> {
        let mut session = self.session.lock().await;
        let result = self.reset_locked(&mut session).await;
        self.finish_operation(&mut session, "reset", result).await
    }

    /// Run the validations of `step_id` (or of the current step).
    ///
    /// Read-only, so no transaction is opened. A failure is returned in the
    /// result and published as `validation:failed`.
    pub async fn validate_step(
        &self,
        step_id: Option<&str>,
    ) -> Result<ValidationResult, WorkflowError> {
        let mut session = self.session.lock().await;
        let result = self.validate_locked(&mut session, step_id).await;
        self.finish_operation(&mut session, "validate_step", result).await
    }

    /// `active -> paused`.
    pub async fn pause(&self) -> Result<WorkflowState, WorkflowError> {
        self.change_status("pause", WorkflowStatus::Paused, None).await
    }

    /// `paused -> active`.
    pub async fn resume(&self) -> Result<WorkflowState, WorkflowError> {
        self.change_status("resume", WorkflowStatus::Active, None).await
    }

    /// Mark the run failed (`active|paused -> failed`).
    pub async fn fail(&self, reason: &str) -> Result<WorkflowState, WorkflowError> {
        self.change_status("fail", WorkflowStatus::Failed, Some(reason))
            .await
    }

    // -----------------------------------------------------------------------
    // Queries (copies, never references into the session)
    // -----------------------------------------------------------------------

    pub async fn current_step(&self) -> Result<Option<Step>, WorkflowError> {
        let session = self.session.lock().await;
        let session = session.as_ref().ok_or(WorkflowError::NotInitialized)?;
        Ok(session
            .template
            .steps
            .get(session.state.current_step_index)
            .cloned())
    }

    pub async fn state(&self) -> Result<WorkflowState, WorkflowError> {
        let session = self.session.lock().await;
        Ok(session
            .as_ref()
            .ok_or(WorkflowError::NotInitialized)?
            .state
            .clone())
    }

    pub async fn template(&self) -> Result<ChecklistTemplate, WorkflowError> {
        let session = self.session.lock().await;
        Ok(session
            .as_ref()
            .ok_or(WorkflowError::NotInitialized)?
            .template
            .clone())
    }

    pub async fn progress(&self) -> Result<Progress, WorkflowError> {
        let session = self.session.lock().await;
        let session = session.as_ref().ok_or(WorkflowError::NotInitialized)?;
        Ok(session.state.progress(session.template.steps.len()))
    }

    pub async fn summary(&self) -> Result<Summary, WorkflowError> {
        let session = self.session.lock().await;
        let session = session.as_ref().ok_or(WorkflowError::NotInitialized)?;
        Ok(Summary::from_state(
            &session.state,
            session.template.steps.len(),
        ))
    }

    // -----------------------------------------------------------------------
    // Transaction wrapper
    // -----------------------------------------------------------------------

    /// Run `apply` inside a transaction.
    ///
    /// `apply` receives a copy of `baseline` and returns the state to persist
    /// (`None` when nothing changed) plus a value for the caller. On any
    /// failure the durable snapshot is restored to `baseline`, the
    /// transaction is rolled back and the error is returned.
    pub async fn execute_with_transaction<F, U>(
        &self,
        operation: &str,
        baseline: &WorkflowState,
        apply: F,
    ) -> Result<(Option<WorkflowState>, U), WorkflowError>
    where
        F: FnOnce(WorkflowState) -> Result<(Option<WorkflowState>, U), WorkflowError>,
    {
        let coordinator = self.store.coordinator();
        let transaction_id = coordinator.begin_transaction(operation, baseline).await?;
        let mut saved = false;

        let outcome = async {
            let (next, value) = apply(baseline.clone())?;
            if let Some(state) = &next {
                let payload = serde_json::to_value(state).map_err(|e| {
                    WorkflowError::Transaction(format!("failed to encode state: {e}"))
                })?;
                coordinator
                    .add_operation(transaction_id, STATE_TARGET, operation, payload)
                    .await?;
                self.store.save_state(state).await?;
                saved = true;
            }
            coordinator.commit_transaction(transaction_id).await?;
            Ok::<_, WorkflowError>((next, value))
        }
        .await;

        if let Err(e) = &outcome {
            if saved {
                if let Err(restore) = self.store.save_state(baseline).await {
                    tracing::warn!(
                        transaction_id = %transaction_id,
                        error = %restore,
                        "failed to restore baseline snapshot"
                    );
                }
            }
            if let Err(rollback) = coordinator.rollback_transaction(transaction_id).await {
                tracing::warn!(
                    transaction_id = %transaction_id,
                    error = %rollback,
                    "rollback failed"
                );
            }
            tracing::debug!(operation, error = %e, "operation aborted");
        }
        outcome
    }

    // -----------------------------------------------------------------------
    // Locked bodies
    // -----------------------------------------------------------------------

    async fn init_locked(
        &self,
        slot: &mut Option<Session>,
        template_id: &str,
        variables: Variables,
    ) -> Result<WorkflowState, WorkflowError> {
        self.events.publish(WorkflowEvent::RecoveryStarted);
        let recovered = self.store.recover_from_incomplete_transactions().await?;
        self.events
            .publish(WorkflowEvent::RecoveryCompleted { recovered });

        let template = self.store.load_template(template_id).await?;
        template
            .validate()
            .map_err(|reason| WorkflowError::TemplateLoad {
                template_id: template_id.to_string(),
                reason,
            })?;

        let initialized = match self
            .store
            .initialize_state(&template, variables.clone())
            .await
        {
            Err(e @ WorkflowError::StateCorruption { .. }) => {
                tracing::warn!(
                    template_id = %template.id,
                    error = %e,
                    "persisted state is corrupted; starting a fresh run"
                );
                self.publish_error(&e);
                self.store.discard_state(&template.id).await?;
                self.store.initialize_state(&template, variables).await?
            }
            other => other?,
        };

        let loaded = initialized.state;
        let settled = self.navigator.settle(&template, loaded.clone())?;
        let state = if !initialized.restored || settled.state != loaded {
            let navigator = &self.navigator;
            let (next, _) = self
                .execute_with_transaction("init", &loaded, |state| {
                    let outcome = navigator.settle(&template, state)?;
                    Ok((Some(outcome.state), ()))
                })
                .await?;
            next.unwrap_or(loaded)
        } else {
            loaded
        };

        *slot = Some(Session {
            template: template.clone(),
            state: state.clone(),
        });

        tracing::info!(
            template_id = %template.id,
            instance_id = ?state.instance_id,
            status = %state.status,
            restored = initialized.restored,
            recovered,
            "workflow initialized"
        );
        self.events.publish(WorkflowEvent::Initialized {
            template_id: template.id.clone(),
            instance_id: state.instance_id,
            status: state.status,
        });
        if settled.finished {
            self.publish_navigation(&template, &state, &settled);
        }
        Ok(state)
    }

    async fn navigate_locked(
        &self,
        slot: &mut Option<Session>,
        step: Move,
    ) -> Result<StepResult, WorkflowError> {
        let session = slot.as_mut().ok_or(WorkflowError::NotInitialized)?;
        let navigator = &self.navigator;
        let template = &session.template;

        let (next, outcome) = self
            .execute_with_transaction(step.name(), &session.state, |state| {
                let outcome = match step {
                    Move::Advance => navigator.advance(template, state)?,
                    Move::Back => navigator.go_back(template, state)?,
                    Move::Skip(reason) => navigator.skip(template, state, reason)?,
                };
                let next = outcome.result.success.then(|| outcome.state.clone());
                Ok((next, outcome))
            })
            .await?;

        if let Some(state) = next {
            session.state = state;
            self.publish_navigation(&session.template, &session.state, &outcome);
        }
        Ok(outcome.result)
    }

    async fn reset_locked(&self, slot: &mut Option<Session>) -> Result<WorkflowState, WorkflowError> {
        let session = slot.as_mut().ok_or(WorkflowError::NotInitialized)?;
        let navigator = &self.navigator;
        let template = &session.template;
        let variables = session.state.variables.clone();

        let (next, settled) = self
            .execute_with_transaction("reset", &session.state, |_| {
                let fresh = WorkflowState::new(template.id.clone(), variables);
                let outcome = navigator.settle(template, fresh)?;
                Ok((Some(outcome.state.clone()), outcome))
            })
            .await?;

        if let Some(state) = next {
            session.state = state;
        }
        tracing::info!(
            template_id = %session.template.id,
            instance_id = ?session.state.instance_id,
            "workflow reset"
        );
        self.events.publish(WorkflowEvent::WorkflowReset {
            template_id: session.template.id.clone(),
            instance_id: session.state.instance_id,
        });
        self.events.publish(WorkflowEvent::StateChanged {
            state: Box::new(session.state.clone()),
        });
        if settled.finished {
            self.publish_navigation(&session.template, &session.state, &settled);
        }
        Ok(session.state.clone())
    }

    async fn validate_locked(
        &self,
        slot: &mut Option<Session>,
        step_id: Option<&str>,
    ) -> Result<ValidationResult, WorkflowError> {
        let session = slot.as_ref().ok_or(WorkflowError::NotInitialized)?;
        let step = match step_id {
            Some(id) => session.template.step(id).ok_or_else(|| {
                WorkflowError::InvalidOperation(format!("unknown step '{id}'"))
            })?,
            None => session
                .template
                .steps
                .get(session.state.current_step_index)
                .ok_or_else(|| {
                    WorkflowError::InvalidOperation("there is no current step to validate".to_string())
                })?,
        };

        let context = ValidationContext {
            step_id: step.id.clone(),
            variables: session.state.variables.clone(),
            working_dir: self.options.working_dir.clone(),
        };
        let result = validate_step(&self.validator, step, &context).await;

        if !result.valid {
            self.events.publish(WorkflowEvent::ValidationFailed {
                step_id: step.id.clone(),
                error: result.error.clone().unwrap_or_default(),
            });
        }
        Ok(result)
    }

    async fn change_status(
        &self,
        operation: &str,
        to: WorkflowStatus,
        reason: Option<&str>,
    ) -> Result<WorkflowState, WorkflowError> {
        let mut slot = self.session.lock().await;
        let result = self.change_status_locked(&mut slot, operation, to, reason).await;
        self.finish_operation(&mut slot, operation, result).await
    }

    async fn change_status_locked(
        &self,
        slot: &mut Option<Session>,
        operation: &str,
        to: WorkflowStatus,
        reason: Option<&str>,
    ) -> Result<WorkflowState, WorkflowError> {
        let session = slot.as_mut().ok_or(WorkflowError::NotInitialized)?;

        let (next, _) = self
            .execute_with_transaction(operation, &session.state, |mut state| {
                validate_state_transition(state.status, to)?;
                state.status = to;
                Ok((Some(state), ()))
            })
            .await?;

        if let Some(state) = next {
            session.state = state;
        }
        match reason {
            Some(reason) => tracing::warn!(
                template_id = %session.template.id,
                status = %to,
                reason,
                "workflow status changed"
            ),
            None => tracing::info!(
                template_id = %session.template.id,
                status = %to,
                "workflow status changed"
            ),
        }
        self.events.publish(WorkflowEvent::StateChanged {
            state: Box::new(session.state.clone()),
        });
        Ok(session.state.clone())
    }

    // -----------------------------------------------------------------------
    // Error and event plumbing
    // -----------------------------------------------------------------------

    /// Publish the error, and move a running workflow to `failed` after an
    /// infrastructure fault.
    async fn finish_operation<U>(
        &self,
        slot: &mut Option<Session>,
        operation: &str,
        result: Result<U, WorkflowError>,
    ) -> Result<U, WorkflowError> {
        let error = match result {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        tracing::warn!(operation, code = error.code(), error = %error, "operation failed");
        self.publish_error(&error);

        if error.is_fatal() {
            if let Some(session) = slot.as_mut() {
                let running = matches!(
                    session.state.status,
                    WorkflowStatus::Active | WorkflowStatus::Paused
                );
                if running {
                    self.try_mark_failed(session).await;
                }
            }
        }
        Err(error)
    }

    async fn try_mark_failed(&self, session: &mut Session) {
        let attempt = self
            .execute_with_transaction("fail", &session.state, |mut state| {
                validate_state_transition(state.status, WorkflowStatus::Failed)?;
                state.status = WorkflowStatus::Failed;
                Ok((Some(state), ()))
            })
            .await;

        match attempt {
            Ok((Some(state), ())) => {
                session.state = state;
                tracing::warn!(template_id = %session.template.id, "workflow marked failed");
                self.events.publish(WorkflowEvent::StateChanged {
                    state: Box::new(session.state.clone()),
                });
            }
            Ok((None, ())) => {}
            Err(e) => {
                tracing::warn!(error = %e, "could not mark workflow failed");
                self.publish_error(&e);
            }
        }
    }

    fn publish_error(&self, error: &WorkflowError) {
        self.events.publish(WorkflowEvent::Error {
            code: error.code().to_string(),
            message: error.to_string(),
            recoverable: error.is_recoverable(),
            context: error.context(),
        });
    }

    /// Completion or skip, then step change, then progress, then (if the run
    /// finished) the summary.
    fn publish_navigation(
        &self,
        template: &ChecklistTemplate,
        state: &WorkflowState,
        outcome: &NavigationOutcome,
    ) {
        if let Some(completed) = &outcome.completed {
            self.events.publish(WorkflowEvent::StepCompleted {
                step: completed.step.clone(),
                duration_ms: completed.duration_ms,
            });
        }
        if let Some(skipped) = &outcome.skipped {
            self.events.publish(WorkflowEvent::StepSkipped {
                step: skipped.step.clone(),
                reason: skipped.reason.clone(),
            });
        }
        self.events.publish(WorkflowEvent::StepChanged {
            step: outcome.result.step.clone(),
            index: state.current_step_index,
        });
        self.events.publish(WorkflowEvent::ProgressUpdated {
            progress: state.progress(template.steps.len()),
        });
        if outcome.finished {
            let summary = Summary::from_state(state, template.steps.len());
            tracing::info!(
                template_id = %template.id,
                completed = summary.completed_steps,
                skipped = summary.skipped_steps,
                duration_ms = ?summary.duration_ms,
                "workflow completed"
            );
            self.events
                .publish(WorkflowEvent::WorkflowCompleted { summary });
        }
    }
}

enum Move {
    Advance,
    Back,
    Skip(String),
}

impl Move {
    fn name(&self) -> &'static str {
        match self {
            Move::Advance => "advance",
            Move::Back => "go_back",
            Move::Skip(_) => "skip",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{MemoryStateRepository, MemoryTemplateSource};
    use crate::transaction::{MemoryWal, TransactionCoordinator};
    use checkflow_types::error::StorageError;
    use checkflow_types::event::EventName;
    use checkflow_types::template::{StepValidation, ValidationType};
    use checkflow_types::transaction::{WalEntry, WalEntryKind, WalRecord};
    use checkflow_types::value::Value;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};
    use uuid::Uuid;

    /// In-memory repository whose next `n` saves fail.
    #[derive(Default)]
    struct FlakyRepository {
        inner: MemoryStateRepository,
        failing_saves: AtomicUsize,
    }

    impl FlakyRepository {
        fn fail_next(&self, n: usize) {
            self.failing_saves.store(n, Ordering::SeqCst);
        }
    }

    impl StateRepository for FlakyRepository {
        async fn load(
            &self,
            template_id: &str,
        ) -> Result<Option<WorkflowState>, StorageError> {
            self.inner.load(template_id).await
        }

        async fn save(&self, state: &WorkflowState) -> Result<(), StorageError> {
            let remaining = self.failing_saves.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failing_saves.store(remaining - 1, Ordering::SeqCst);
                return Err(StorageError::Io(std::io::Error::other("disk full")));
            }
            self.inner.save(state).await
        }

        async fn delete(&self, template_id: &str) -> Result<bool, StorageError> {
            self.inner.delete(template_id).await
        }
    }

    /// Passes every check whose payload is "ok".
    struct CheckValidator;

    impl StepValidator for CheckValidator {
        async fn run_validation(
            &self,
            validation: &StepValidation,
            _context: &ValidationContext,
        ) -> ValidationResult {
            if validation.check == "ok" {
                ValidationResult::valid()
            } else {
                ValidationResult::invalid("check failed")
            }
        }
    }

    type TestEngine = WorkflowEngine<
        Arc<FlakyRepository>,
        Arc<MemoryWal>,
        Arc<MemoryTemplateSource>,
        CheckValidator,
    >;

    struct Harness {
        repo: Arc<FlakyRepository>,
        wal: Arc<MemoryWal>,
        templates: Arc<MemoryTemplateSource>,
    }

    impl Harness {
        fn new(templates: Vec<ChecklistTemplate>) -> Self {
            let source = MemoryTemplateSource::new();
            for template in templates {
                source.insert(template);
            }
            Self {
                repo: Arc::new(FlakyRepository::default()),
                wal: Arc::new(MemoryWal::new()),
                templates: Arc::new(source),
            }
        }

        /// A fresh engine over the same storage, as after a restart.
        fn engine(&self) -> TestEngine {
            WorkflowEngine::new(
                StateStore::new(
                    Arc::clone(&self.repo),
                    Arc::clone(&self.wal),
                    Arc::clone(&self.templates),
                ),
                CheckValidator,
                EngineOptions::default(),
            )
        }
    }

    fn template(id: &str, steps: Vec<Step>) -> ChecklistTemplate {
        ChecklistTemplate {
            id: id.to_string(),
            name: id.to_string(),
            version: None,
            description: None,
            steps,
            variables: None,
            metadata: None,
        }
    }

    fn three_steps() -> ChecklistTemplate {
        template(
            "three",
            vec![
                Step::new("step1", "One"),
                Step::new("step2", "Two"),
                Step::new("step3", "Three"),
            ],
        )
    }

    fn record_events(engine: &TestEngine) -> Arc<StdMutex<Vec<WorkflowEvent>>> {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        engine
            .events()
            .subscribe_all(move |e| sink.lock().unwrap().push(e.clone()));
        events
    }

    fn names(events: &Arc<StdMutex<Vec<WorkflowEvent>>>) -> Vec<EventName> {
        events.lock().unwrap().iter().map(|e| e.name()).collect()
    }

    fn error_codes(events: &Arc<StdMutex<Vec<WorkflowEvent>>>) -> Vec<String> {
        events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                WorkflowEvent::Error { code, .. } => Some(code.clone()),
                _ => None,
            })
            .collect()
    }

    fn step_id(result: &StepResult) -> Option<&str> {
        result.step.as_ref().map(|s| s.id.as_str())
    }

    #[tokio::test]
    async fn operations_require_init() {
        let h = Harness::new(vec![three_steps()]);
        let engine = h.engine();
        let events = record_events(&engine);

        assert!(matches!(
            engine.advance().await,
            Err(WorkflowError::NotInitialized)
        ));
        assert!(matches!(engine.state().await, Err(WorkflowError::NotInitialized)));
        assert!(!engine.is_initialized().await);
        assert_eq!(error_codes(&events), vec!["NOT_INITIALIZED"]);
    }

    #[tokio::test]
    async fn init_runs_recovery_and_announces_itself() {
        let h = Harness::new(vec![three_steps()]);
        let engine = h.engine();
        let events = record_events(&engine);

        let state = engine.init("three", Variables::new()).await.unwrap();

        assert_eq!(state.status, WorkflowStatus::Idle);
        assert_eq!(
            names(&events),
            vec![
                EventName::RecoveryStarted,
                EventName::RecoveryCompleted,
                EventName::Initialized
            ]
        );
        assert_eq!(h.repo.load("three").await.unwrap(), Some(state));
        assert!(h.wal.is_empty().await);
    }

    #[tokio::test]
    async fn three_steps_end_to_end() {
        let h = Harness::new(vec![three_steps()]);
        let engine = h.engine();
        engine.init("three", Variables::new()).await.unwrap();
        let events = record_events(&engine);

        let first = engine.advance().await.unwrap();
        assert_eq!(step_id(&first), Some("step2"));
        let second = engine.advance().await.unwrap();
        assert_eq!(step_id(&second), Some("step3"));
        let third = engine.advance().await.unwrap();
        assert!(third.success);
        assert_eq!(step_id(&third), None);

        let state = engine.state().await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Completed);
        assert_eq!(state.completed_steps.len(), 3);
        assert_eq!(state.current_step_index, 3);
        assert!(engine.current_step().await.unwrap().is_none());

        use EventName::*;
        assert_eq!(
            names(&events),
            vec![
                StepCompleted,
                StepChanged,
                ProgressUpdated,
                StepCompleted,
                StepChanged,
                ProgressUpdated,
                StepCompleted,
                StepChanged,
                ProgressUpdated,
                WorkflowCompleted,
            ]
        );

        let summary = engine.summary().await.unwrap();
        assert_eq!(summary.completed_steps, 3);
        assert_eq!(summary.total_steps, 3);
        assert_eq!(summary.status, WorkflowStatus::Completed);
        assert_eq!(engine.progress().await.unwrap().percent, 100.0);
        assert!(h.wal.is_empty().await);
    }

    #[tokio::test]
    async fn hidden_step_is_passed_over() {
        let tpl = template(
            "cond",
            vec![
                Step::new("stepA", "A"),
                Step::new("stepB", "B").with_condition("${flag} === true"),
                Step::new("stepC", "C"),
            ],
        );
        let h = Harness::new(vec![tpl]);
        let engine = h.engine();
        let mut vars = Variables::new();
        vars.insert("flag".to_string(), Value::from(false));
        engine.init("cond", vars).await.unwrap();

        let result = engine.advance().await.unwrap();

        assert_eq!(step_id(&result), Some("stepC"));
        let state = engine.state().await.unwrap();
        assert!(!state.is_completed_step("stepB"));
        assert!(!state.is_skipped_step("stepB"));
    }

    #[tokio::test]
    async fn skip_records_reason() {
        let h = Harness::new(vec![three_steps()]);
        let engine = h.engine();
        engine.init("three", Variables::new()).await.unwrap();
        let events = record_events(&engine);

        let result = engine
            .skip(Some("not applicable".to_string()))
            .await
            .unwrap();
        assert_eq!(step_id(&result), Some("step2"));

        let state = engine.state().await.unwrap();
        assert_eq!(state.skipped_steps.len(), 1);
        assert_eq!(state.skipped_steps[0].step.id, "step1");
        assert_eq!(
            state.skipped_steps[0].reason.as_deref(),
            Some("not applicable")
        );
        assert_eq!(
            names(&events),
            vec![
                EventName::StepSkipped,
                EventName::StepChanged,
                EventName::ProgressUpdated
            ]
        );

        engine.skip(None).await.unwrap();
        let state = engine.state().await.unwrap();
        assert_eq!(
            state.skipped_steps[1].reason.as_deref(),
            Some("Skipped by user")
        );
    }

    #[tokio::test]
    async fn go_back_without_predecessor_changes_nothing() {
        let h = Harness::new(vec![three_steps()]);
        let engine = h.engine();
        let before = engine.init("three", Variables::new()).await.unwrap();
        let events = record_events(&engine);

        let result = engine.go_back().await.unwrap();

        assert!(!result.success);
        assert_eq!(engine.state().await.unwrap(), before);
        assert_eq!(h.repo.load("three").await.unwrap(), Some(before));
        assert!(names(&events).is_empty());
        assert!(h.wal.is_empty().await);
    }

    #[tokio::test]
    async fn go_back_undoes_completion() {
        let h = Harness::new(vec![three_steps()]);
        let engine = h.engine();
        engine.init("three", Variables::new()).await.unwrap();
        engine.advance().await.unwrap();
        engine.advance().await.unwrap();

        let result = engine.go_back().await.unwrap();

        assert_eq!(step_id(&result), Some("step2"));
        let state = engine.state().await.unwrap();
        assert!(state.is_completed_step("step1"));
        assert!(!state.is_completed_step("step2"));
    }

    #[tokio::test]
    async fn failed_save_rolls_back_completely() {
        let h = Harness::new(vec![three_steps()]);
        let engine = h.engine();
        engine.init("three", Variables::new()).await.unwrap();
        engine.advance().await.unwrap();
        let before = engine.state().await.unwrap();
        let events = record_events(&engine);

        h.repo.fail_next(usize::MAX);
        let err = engine.advance().await.unwrap_err();

        assert!(matches!(err, WorkflowError::Storage(_)));
        assert_eq!(engine.state().await.unwrap(), before);
        assert_eq!(h.repo.load("three").await.unwrap(), Some(before.clone()));
        assert!(h.wal.is_empty().await);
        assert_eq!(error_codes(&events), vec!["STORAGE_ERROR", "STORAGE_ERROR"]);

        h.repo.fail_next(0);
        let result = engine.advance().await.unwrap();
        assert_eq!(step_id(&result), Some("step3"));
    }

    /// In-memory WAL that refuses `commit` markers while armed.
    struct CommitFailingWal {
        inner: MemoryWal,
        failing_commits: AtomicUsize,
    }

    impl WalLog for CommitFailingWal {
        async fn append(&self, record: WalRecord) -> Result<WalEntry, StorageError> {
            if record.kind == WalEntryKind::Commit {
                let remaining = self.failing_commits.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.failing_commits.store(remaining - 1, Ordering::SeqCst);
                    return Err(StorageError::Io(std::io::Error::other("wal device lost")));
                }
            }
            self.inner.append(record).await
        }

        async fn read_all(&self) -> Result<Vec<WalEntry>, StorageError> {
            self.inner.read_all().await
        }

        async fn remove_transaction(&self, transaction_id: Uuid) -> Result<(), StorageError> {
            self.inner.remove_transaction(transaction_id).await
        }

        async fn clear(&self) -> Result<(), StorageError> {
            self.inner.clear().await
        }
    }

    #[tokio::test]
    async fn failed_commit_restores_saved_snapshot() {
        let repo = Arc::new(FlakyRepository::default());
        let wal = Arc::new(CommitFailingWal {
            inner: MemoryWal::new(),
            failing_commits: AtomicUsize::new(0),
        });
        let templates = MemoryTemplateSource::new();
        templates.insert(three_steps());
        let engine = WorkflowEngine::new(
            StateStore::new(Arc::clone(&repo), Arc::clone(&wal), Arc::new(templates)),
            CheckValidator,
            EngineOptions::default(),
        );
        engine.init("three", Variables::new()).await.unwrap();
        engine.advance().await.unwrap();
        let before = engine.state().await.unwrap();
        let errors = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        engine.events().subscribe_all(move |e| {
            if let WorkflowEvent::Error { code, .. } = e {
                sink.lock().unwrap().push(code.clone());
            }
        });

        // The snapshot save succeeds; only the commit marker is lost, and
        // so is the follow-up attempt to mark the run failed.
        wal.failing_commits.store(usize::MAX, Ordering::SeqCst);
        let err = engine.advance().await.unwrap_err();

        assert!(matches!(err, WorkflowError::Transaction(_)));
        assert_eq!(engine.state().await.unwrap(), before);
        assert_eq!(repo.load("three").await.unwrap(), Some(before.clone()));
        assert_eq!(
            *errors.lock().unwrap(),
            vec!["TRANSACTION_ERROR", "TRANSACTION_ERROR"]
        );
        assert!(!engine
            .store()
            .coordinator()
            .has_incomplete_transactions()
            .await
            .unwrap());

        wal.failing_commits.store(0, Ordering::SeqCst);
        let result = engine.advance().await.unwrap();
        assert_eq!(step_id(&result), Some("step3"));
    }

    #[tokio::test]
    async fn storage_fault_marks_running_workflow_failed() {
        let h = Harness::new(vec![three_steps()]);
        let engine = h.engine();
        engine.init("three", Variables::new()).await.unwrap();
        engine.advance().await.unwrap();

        h.repo.fail_next(1);
        assert!(engine.advance().await.is_err());

        let state = engine.state().await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Failed);
        assert_eq!(state.completed_steps.len(), 1);
        assert_eq!(
            h.repo.load("three").await.unwrap().unwrap().status,
            WorkflowStatus::Failed
        );

        let err = engine.advance().await.unwrap_err();
        assert!(matches!(err, WorkflowError::StateTransition { .. }));

        let state = engine.reset().await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Idle);
    }

    #[tokio::test]
    async fn committed_state_survives_restart() {
        let h = Harness::new(vec![three_steps()]);
        let engine = h.engine();
        engine.init("three", Variables::new()).await.unwrap();
        engine.advance().await.unwrap();
        let committed = engine.state().await.unwrap();
        drop(engine);

        let restarted = h.engine();
        let state = restarted.init("three", Variables::new()).await.unwrap();
        assert_eq!(state, committed);
    }

    #[tokio::test]
    async fn uncommitted_transaction_is_replayed_on_init() {
        let h = Harness::new(vec![three_steps()]);
        let engine = h.engine();
        let before = engine.init("three", Variables::new()).await.unwrap();
        drop(engine);

        // Crash after the operation entry was logged but before the snapshot
        // write and commit.
        let mut after = before.clone();
        after.status = WorkflowStatus::Active;
        after.current_step_index = 1;
        let coord = TransactionCoordinator::new(Arc::clone(&h.wal));
        let tx = coord.begin_transaction("advance", &before).await.unwrap();
        coord
            .add_operation(
                tx,
                STATE_TARGET,
                "advance",
                serde_json::to_value(&after).unwrap(),
            )
            .await
            .unwrap();

        let restarted = h.engine();
        let events = record_events(&restarted);
        let state = restarted.init("three", Variables::new()).await.unwrap();

        assert_eq!(state, after);
        assert!(h.wal.is_empty().await);
        let recovered = events.lock().unwrap().iter().find_map(|e| match e {
            WorkflowEvent::RecoveryCompleted { recovered } => Some(*recovered),
            _ => None,
        });
        assert_eq!(recovered, Some(1));
    }

    #[tokio::test]
    async fn transaction_without_operations_is_discarded_on_init() {
        let h = Harness::new(vec![three_steps()]);
        let engine = h.engine();
        let before = engine.init("three", Variables::new()).await.unwrap();
        drop(engine);

        let coord = TransactionCoordinator::new(Arc::clone(&h.wal));
        coord.begin_transaction("advance", &before).await.unwrap();

        let restarted = h.engine();
        let state = restarted.init("three", Variables::new()).await.unwrap();
        assert_eq!(state, before);
        assert!(h.wal.is_empty().await);
    }

    #[tokio::test]
    async fn corrupted_state_is_reset() {
        let h = Harness::new(vec![three_steps()]);
        let mut corrupt = WorkflowState::new("three", Variables::new());
        corrupt.status = WorkflowStatus::Active;
        corrupt.current_step_index = 42;
        h.repo.save(&corrupt).await.unwrap();

        let engine = h.engine();
        let events = record_events(&engine);
        let state = engine.init("three", Variables::new()).await.unwrap();

        assert_eq!(state.status, WorkflowStatus::Idle);
        assert_eq!(state.current_step_index, 0);
        assert_ne!(state.instance_id, corrupt.instance_id);
        assert_eq!(error_codes(&events), vec!["STATE_CORRUPTION_ERROR"]);
        assert_eq!(h.repo.load("three").await.unwrap(), Some(state));
    }

    #[tokio::test]
    async fn pause_blocks_navigation_until_resume() {
        let h = Harness::new(vec![three_steps()]);
        let engine = h.engine();
        engine.init("three", Variables::new()).await.unwrap();

        let err = engine.pause().await.unwrap_err();
        assert!(matches!(err, WorkflowError::StateTransition { .. }));

        engine.advance().await.unwrap();
        let paused = engine.pause().await.unwrap();
        assert_eq!(paused.status, WorkflowStatus::Paused);

        let err = engine.advance().await.unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidOperation(_)));
        assert_eq!(engine.state().await.unwrap(), paused);

        let resumed = engine.resume().await.unwrap();
        assert_eq!(resumed.status, WorkflowStatus::Active);
        let result = engine.advance().await.unwrap();
        assert_eq!(step_id(&result), Some("step3"));
    }

    #[tokio::test]
    async fn failed_run_only_resets() {
        let h = Harness::new(vec![three_steps()]);
        let engine = h.engine();
        engine.init("three", Variables::new()).await.unwrap();
        engine.advance().await.unwrap();

        let failed = engine.fail("operator aborted").await.unwrap();
        assert_eq!(failed.status, WorkflowStatus::Failed);
        assert!(engine.fail("again").await.is_err());
        assert!(engine.resume().await.is_err());

        let state = engine.reset().await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Idle);
        assert!(state.completed_steps.is_empty());
    }

    #[tokio::test]
    async fn reset_starts_a_new_run() {
        let h = Harness::new(vec![three_steps()]);
        let engine = h.engine();
        let mut vars = Variables::new();
        vars.insert("env".to_string(), Value::from("prod"));
        let first = engine.init("three", vars).await.unwrap();
        for _ in 0..3 {
            engine.advance().await.unwrap();
        }
        let events = record_events(&engine);

        let state = engine.reset().await.unwrap();

        assert_eq!(state.status, WorkflowStatus::Idle);
        assert!(state.completed_steps.is_empty());
        assert_ne!(state.instance_id, first.instance_id);
        assert_eq!(state.variables.get("env"), Some(&Value::from("prod")));
        assert_eq!(
            names(&events),
            vec![EventName::WorkflowReset, EventName::StateChanged]
        );
        assert_eq!(h.repo.load("three").await.unwrap(), Some(state));
    }

    #[tokio::test]
    async fn validate_step_reports_failures() {
        let tpl = template(
            "checked",
            vec![
                Step::new("build", "Build")
                    .with_validation(StepValidation::new(ValidationType::Command, "ok")),
                Step::new("test", "Test")
                    .with_validation(StepValidation::new(ValidationType::Command, "bad")),
            ],
        );
        let h = Harness::new(vec![tpl]);
        let engine = h.engine();
        engine.init("checked", Variables::new()).await.unwrap();
        let events = record_events(&engine);

        assert!(engine.validate_step(None).await.unwrap().valid);

        let result = engine.validate_step(Some("test")).await.unwrap();
        assert!(!result.valid);
        assert_eq!(result.error.as_deref(), Some("check failed"));
        assert_eq!(names(&events), vec![EventName::ValidationFailed]);

        let err = engine.validate_step(Some("deploy")).await.unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn concurrent_advances_are_serialized() {
        let steps = (0..4).map(|i| Step::new(format!("s{i}"), "step")).collect();
        let h = Harness::new(vec![template("many", steps)]);
        let engine = h.engine();
        engine.init("many", Variables::new()).await.unwrap();

        let (a, b, c, d) = tokio::join!(
            engine.advance(),
            engine.advance(),
            engine.advance(),
            engine.advance()
        );
        for result in [a, b, c, d] {
            assert!(result.unwrap().success);
        }

        let state = engine.state().await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Completed);
        let ids: HashSet<_> = state.completed_steps.iter().map(|c| c.step.id.clone()).collect();
        assert_eq!(ids.len(), 4);
        assert_eq!(state.completed_steps.len(), 4);
    }

    #[tokio::test]
    async fn empty_template_completes_on_init() {
        let h = Harness::new(vec![template("empty", Vec::new())]);
        let engine = h.engine();
        let events = record_events(&engine);

        let state = engine.init("empty", Variables::new()).await.unwrap();

        assert_eq!(state.status, WorkflowStatus::Completed);
        assert!(names(&events).contains(&EventName::WorkflowCompleted));
    }

    #[tokio::test]
    async fn bad_templates_fail_init_without_state() {
        let duplicate = template(
            "dup",
            vec![Step::new("same", "One"), Step::new("same", "Two")],
        );
        let h = Harness::new(vec![duplicate]);
        let engine = h.engine();

        let err = engine.init("dup", Variables::new()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::TemplateLoad { .. }));
        let err = engine.init("missing", Variables::new()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::TemplateLoad { .. }));

        assert!(!engine.is_initialized().await);
        assert!(h.repo.load("dup").await.unwrap().is_none());
    }
}
