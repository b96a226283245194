//! Snapshot repository and template source ports.
//!
//! Defines the interfaces for durable `WorkflowState` snapshots and for
//! template loading. File-backed implementations live in checkflow-infra.

use std::sync::Arc;

use checkflow_types::error::{StorageError, WorkflowError};
use checkflow_types::state::WorkflowState;
use checkflow_types::template::ChecklistTemplate;
use dashmap::DashMap;

/// Durable store for one state snapshot per template id.
///
/// Uses RPITIT (native async fn in traits, Rust 2024 edition).
pub trait StateRepository: Send + Sync {
    /// Load the snapshot for `template_id`. `None` when nothing was saved.
    fn load(
        &self,
        template_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowState>, StorageError>> + Send;

    /// Replace the snapshot keyed by `state.template_id`.
    fn save(
        &self,
        state: &WorkflowState,
    ) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;

    /// Delete the snapshot. Returns `true` if one existed.
    fn delete(
        &self,
        template_id: &str,
    ) -> impl std::future::Future<Output = Result<bool, StorageError>> + Send;
}

/// Loads checklist templates by id.
pub trait TemplateSource: Send + Sync {
    /// Fails with `WorkflowError::TemplateLoad` when the template is missing
    /// or unparseable.
    fn load_template(
        &self,
        template_id: &str,
    ) -> impl std::future::Future<Output = Result<ChecklistTemplate, WorkflowError>> + Send;
}

impl<R: StateRepository> StateRepository for Arc<R> {
    async fn load(&self, template_id: &str) -> Result<Option<WorkflowState>, StorageError> {
        (**self).load(template_id).await
    }

    async fn save(&self, state: &WorkflowState) -> Result<(), StorageError> {
        (**self).save(state).await
    }

    async fn delete(&self, template_id: &str) -> Result<bool, StorageError> {
        (**self).delete(template_id).await
    }
}

impl<T: TemplateSource> TemplateSource for Arc<T> {
    async fn load_template(&self, template_id: &str) -> Result<ChecklistTemplate, WorkflowError> {
        (**self).load_template(template_id).await
    }
}

/// Key a snapshot is stored under.
pub fn snapshot_key(state: &WorkflowState) -> Result<&str, StorageError> {
    state
        .template_id
        .as_deref()
        .ok_or_else(|| StorageError::Serialization("state has no template id".to_string()))
}

// ---------------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------------

/// In-memory `StateRepository`.
#[derive(Debug, Default)]
pub struct MemoryStateRepository {
    states: DashMap<String, WorkflowState>,
}

impl MemoryStateRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateRepository for MemoryStateRepository {
    async fn load(&self, template_id: &str) -> Result<Option<WorkflowState>, StorageError> {
        Ok(self.states.get(template_id).map(|s| s.value().clone()))
    }

    async fn save(&self, state: &WorkflowState) -> Result<(), StorageError> {
        let key = snapshot_key(state)?;
        self.states.insert(key.to_string(), state.clone());
        Ok(())
    }

    async fn delete(&self, template_id: &str) -> Result<bool, StorageError> {
        Ok(self.states.remove(template_id).is_some())
    }
}

/// In-memory `TemplateSource`.
#[derive(Debug, Default)]
pub struct MemoryTemplateSource {
    templates: DashMap<String, ChecklistTemplate>,
}

impl MemoryTemplateSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_template(self, template: ChecklistTemplate) -> Self {
        self.insert(template);
        self
    }

    pub fn insert(&self, template: ChecklistTemplate) {
        self.templates.insert(template.id.clone(), template);
    }
}

impl TemplateSource for MemoryTemplateSource {
    async fn load_template(&self, template_id: &str) -> Result<ChecklistTemplate, WorkflowError> {
        self.templates
            .get(template_id)
            .map(|t| t.value().clone())
            .ok_or_else(|| WorkflowError::TemplateLoad {
                template_id: template_id.to_string(),
                reason: "template not found".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use checkflow_types::value::Variables;

    #[tokio::test]
    async fn memory_repository_save_load_delete() {
        let repo = MemoryStateRepository::new();
        let state = WorkflowState::new("tpl", Variables::new());

        assert!(repo.load("tpl").await.unwrap().is_none());
        repo.save(&state).await.unwrap();
        assert_eq!(repo.load("tpl").await.unwrap(), Some(state));
        assert!(repo.delete("tpl").await.unwrap());
        assert!(!repo.delete("tpl").await.unwrap());
    }

    #[tokio::test]
    async fn memory_repository_requires_template_id() {
        let repo = MemoryStateRepository::new();
        let mut state = WorkflowState::new("tpl", Variables::new());
        state.template_id = None;
        assert!(matches!(
            repo.save(&state).await,
            Err(StorageError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn memory_template_source_reports_missing() {
        let source = MemoryTemplateSource::new();
        let err = source.load_template("nope").await.unwrap_err();
        assert_eq!(err.code(), "TEMPLATE_LOAD_ERROR");
    }
}
