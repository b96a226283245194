//! Workflow state store.
//!
//! Owns the snapshot repository, the transaction coordinator and the
//! template source. The engine calls `save_state` only from inside an open
//! transaction; the store itself never decides when to persist.

use std::collections::HashSet;

use checkflow_types::error::WorkflowError;
use checkflow_types::state::{WorkflowState, WorkflowStatus};
use checkflow_types::template::ChecklistTemplate;
use checkflow_types::transaction::{STATE_TARGET, WalEntry};
use checkflow_types::value::Variables;

use super::repository::{StateRepository, TemplateSource};
use crate::transaction::{TransactionCoordinator, WalLog};

/// State returned by [`StateStore::initialize_state`].
#[derive(Debug, Clone)]
pub struct InitializedState {
    pub state: WorkflowState,
    /// Loaded from the repository rather than freshly created.
    pub restored: bool,
}

/// Persistence facade used by the workflow engine.
pub struct StateStore<R: StateRepository, L: WalLog, T: TemplateSource> {
    repository: R,
    coordinator: TransactionCoordinator<L>,
    templates: T,
}

impl<R: StateRepository, L: WalLog, T: TemplateSource> StateStore<R, L, T> {
    pub fn new(repository: R, wal: L, templates: T) -> Self {
        Self {
            repository,
            coordinator: TransactionCoordinator::new(wal),
            templates,
        }
    }

    pub fn coordinator(&self) -> &TransactionCoordinator<L> {
        &self.coordinator
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub async fn load_template(&self, template_id: &str) -> Result<ChecklistTemplate, WorkflowError> {
        self.templates.load_template(template_id).await
    }

    /// Load the persisted state for `template`, or build a fresh idle one.
    ///
    /// A persisted state wins over `variables`. A fresh state starts from the
    /// template's default variables with `variables` layered on top. A
    /// persisted state that fails [`check_integrity`] is reported as
    /// `StateCorruption`.
    pub async fn initialize_state(
        &self,
        template: &ChecklistTemplate,
        variables: Variables,
    ) -> Result<InitializedState, WorkflowError> {
        if let Some(state) = self.repository.load(&template.id).await? {
            check_integrity(&state, template)?;
            tracing::debug!(
                template_id = %template.id,
                status = %state.status,
                step = state.current_step_index,
                "loaded persisted workflow state"
            );
            return Ok(InitializedState {
                state,
                restored: true,
            });
        }

        let mut merged = template.variables.clone().unwrap_or_default();
        merged.extend(variables);
        let state = WorkflowState::new(template.id.clone(), merged);
        tracing::debug!(
            template_id = %template.id,
            instance_id = ?state.instance_id,
            "created fresh workflow state"
        );
        Ok(InitializedState {
            state,
            restored: false,
        })
    }

    /// Durably write `state`. Call only inside an open transaction.
    pub async fn save_state(&self, state: &WorkflowState) -> Result<(), WorkflowError> {
        self.repository.save(state).await?;
        tracing::debug!(
            template_id = ?state.template_id,
            status = %state.status,
            step = state.current_step_index,
            "state checkpoint written"
        );
        Ok(())
    }

    /// Remove the persisted snapshot for `template_id`.
    pub async fn discard_state(&self, template_id: &str) -> Result<bool, WorkflowError> {
        Ok(self.repository.delete(template_id).await?)
    }

    /// Replay uncommitted WAL entries into the snapshot repository.
    ///
    /// Every replayed entry carries a full state snapshot, so replay is
    /// idempotent. Entries whose payload cannot be decoded are skipped.
    pub async fn recover_from_incomplete_transactions(&self) -> Result<usize, WorkflowError> {
        let repository = &self.repository;
        let recovered = self
            .coordinator
            .recover_from_wal(move |entry: WalEntry| async move {
                if entry.record.target != STATE_TARGET {
                    tracing::warn!(
                        sequence = entry.sequence,
                        target = %entry.record.target,
                        "skipping WAL entry with unknown target"
                    );
                    return Ok(());
                }
                let state: WorkflowState = match serde_json::from_value(entry.record.payload) {
                    Ok(state) => state,
                    Err(e) => {
                        tracing::warn!(
                            sequence = entry.sequence,
                            error = %e,
                            "skipping undecodable WAL entry"
                        );
                        return Ok(());
                    }
                };
                repository.save(&state).await?;
                Ok::<(), WorkflowError>(())
            })
            .await?;

        if recovered > 0 {
            tracing::info!(recovered, "replayed incomplete transactions");
        }
        Ok(recovered)
    }
}

/// Check that a persisted state is consistent with its template.
///
/// Fails with `StateCorruption` when the template id differs, the index is
/// out of range or inconsistent with the status, or a step record names an
/// unknown or repeated step id.
pub fn check_integrity(
    state: &WorkflowState,
    template: &ChecklistTemplate,
) -> Result<(), WorkflowError> {
    let corrupt = |reason: String| Err(WorkflowError::StateCorruption { reason });
    let total = template.steps.len();

    if let Some(id) = &state.template_id {
        if id != &template.id {
            return corrupt(format!(
                "state belongs to template '{id}', not '{}'",
                template.id
            ));
        }
    }
    if state.current_step_index > total {
        return corrupt(format!(
            "current step index {} is beyond {total} steps",
            state.current_step_index
        ));
    }
    if state.status == WorkflowStatus::Completed && state.current_step_index != total {
        return corrupt(format!(
            "completed state points at step {} of {total}",
            state.current_step_index
        ));
    }
    if total > 0 && state.current_step_index == total && state.status != WorkflowStatus::Completed
    {
        return corrupt(format!(
            "{} state points past the last step",
            state.status
        ));
    }

    let mut seen = HashSet::new();
    let recorded = state
        .completed_steps
        .iter()
        .map(|c| &c.step.id)
        .chain(state.skipped_steps.iter().map(|s| &s.step.id));
    for id in recorded {
        if template.index_of(id).is_none() {
            return corrupt(format!("unknown step id '{id}'"));
        }
        if !seen.insert(id) {
            return corrupt(format!("step '{id}' is recorded more than once"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::repository::{MemoryStateRepository, MemoryTemplateSource};
    use crate::transaction::MemoryWal;
    use checkflow_types::state::CompletedStep;
    use checkflow_types::template::Step;
    use checkflow_types::value::Value;
    use chrono::Utc;
    use serde_json::json;

    fn template() -> ChecklistTemplate {
        let mut defaults = Variables::new();
        defaults.insert("env".to_string(), Value::from("dev"));
        defaults.insert("region".to_string(), Value::from("eu"));
        ChecklistTemplate {
            id: "deploy".to_string(),
            name: "Deploy".to_string(),
            version: None,
            description: None,
            steps: vec![Step::new("a", "A"), Step::new("b", "B")],
            variables: Some(defaults),
            metadata: None,
        }
    }

    fn store() -> StateStore<MemoryStateRepository, MemoryWal, MemoryTemplateSource> {
        StateStore::new(
            MemoryStateRepository::new(),
            MemoryWal::new(),
            MemoryTemplateSource::new().with_template(template()),
        )
    }

    #[tokio::test]
    async fn fresh_state_merges_variables() {
        let store = store();
        let mut vars = Variables::new();
        vars.insert("env".to_string(), Value::from("prod"));

        let init = store.initialize_state(&template(), vars).await.unwrap();
        assert!(!init.restored);
        let state = init.state;

        assert_eq!(state.status, WorkflowStatus::Idle);
        assert_eq!(state.template_id.as_deref(), Some("deploy"));
        assert_eq!(state.variables.get("env"), Some(&Value::from("prod")));
        assert_eq!(state.variables.get("region"), Some(&Value::from("eu")));
    }

    #[tokio::test]
    async fn persisted_state_wins() {
        let store = store();
        let mut saved = WorkflowState::new("deploy", Variables::new());
        saved.status = WorkflowStatus::Active;
        saved.current_step_index = 1;
        store.save_state(&saved).await.unwrap();

        let init = store
            .initialize_state(&template(), Variables::new())
            .await
            .unwrap();
        assert!(init.restored);
        assert_eq!(init.state, saved);
    }

    #[tokio::test]
    async fn inconsistent_persisted_state_is_corruption() {
        let store = store();
        let mut saved = WorkflowState::new("deploy", Variables::new());
        saved.current_step_index = 7;
        store.save_state(&saved).await.unwrap();

        let err = store
            .initialize_state(&template(), Variables::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::StateCorruption { .. }));
        assert!(err.is_recoverable());

        assert!(store.discard_state("deploy").await.unwrap());
        assert!(store
            .initialize_state(&template(), Variables::new())
            .await
            .is_ok());
    }

    #[test]
    fn integrity_rejects_duplicates_and_unknown_steps() {
        let tpl = template();
        let mut state = WorkflowState::new("deploy", Variables::new());
        let record = |id: &str| CompletedStep {
            step: Step::new(id, id),
            completed_at: Utc::now(),
            duration_ms: None,
        };

        state.completed_steps = vec![record("a"), record("a")];
        assert!(check_integrity(&state, &tpl).is_err());

        state.completed_steps = vec![record("zzz")];
        assert!(check_integrity(&state, &tpl).is_err());

        state.completed_steps = vec![record("a")];
        state.current_step_index = 1;
        assert!(check_integrity(&state, &tpl).is_ok());

        state.status = WorkflowStatus::Completed;
        assert!(check_integrity(&state, &tpl).is_err());

        state.template_id = Some("other".to_string());
        state.status = WorkflowStatus::Active;
        assert!(check_integrity(&state, &tpl).is_err());
    }

    #[tokio::test]
    async fn recovery_writes_uncommitted_state() {
        let store = store();
        let baseline = WorkflowState::new("deploy", Variables::new());
        let mut advanced = baseline.clone();
        advanced.status = WorkflowStatus::Active;
        advanced.current_step_index = 1;

        let coord = store.coordinator();
        let tx = coord.begin_transaction("advance", &baseline).await.unwrap();
        coord
            .add_operation(
                tx,
                STATE_TARGET,
                "advance",
                serde_json::to_value(&advanced).unwrap(),
            )
            .await
            .unwrap();
        coord
            .add_operation(tx, "elsewhere", "noop", json!({}))
            .await
            .unwrap();
        // Simulated crash: the transaction is never committed.

        let recovered = store.recover_from_incomplete_transactions().await.unwrap();
        assert_eq!(recovered, 2);
        assert_eq!(store.repository().load("deploy").await.unwrap(), Some(advanced));
        assert!(coord.wal().is_empty().await);
    }

    #[tokio::test]
    async fn load_template_delegates() {
        let store = store();
        assert_eq!(store.load_template("deploy").await.unwrap().name, "Deploy");
        assert!(matches!(
            store.load_template("missing").await,
            Err(WorkflowError::TemplateLoad { .. })
        ));
    }
}
