//! File-backed workflow state snapshots.
//!
//! One JSON file per template, `state/{template_id}.json`, wrapping the
//! state in an envelope with a SHA-256 checksum:
//!
//! ```json
//! { "version": 1, "checksum": "…", "savedAt": "…", "state": { … } }
//! ```
//!
//! The checksum covers the compact serialization of `state` with sorted
//! keys, so it survives pretty-printing of the envelope. Writes go through a
//! temp file and a rename.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use checkflow_core::state::StateRepository;
use checkflow_core::state::repository::snapshot_key;
use checkflow_types::error::StorageError;
use checkflow_types::state::WorkflowState;
use serde::{Deserialize, Serialize};

use crate::crypto::hash::Sha256ContentHasher;
use crate::filesystem::{check_file_stem, write_atomic};

const ENVELOPE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotEnvelope {
    version: u32,
    checksum: String,
    saved_at: DateTime<Utc>,
    state: serde_json::Value,
}

/// `StateRepository` storing one checksummed snapshot file per template.
#[derive(Debug, Clone)]
pub struct FileStateRepository {
    dir: PathBuf,
    hasher: Sha256ContentHasher,
}

impl FileStateRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            hasher: Sha256ContentHasher::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot path for a template id.
    pub fn path_for(&self, template_id: &str) -> Result<PathBuf, StorageError> {
        check_file_stem(template_id).map_err(|reason| {
            StorageError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, reason))
        })?;
        Ok(self.dir.join(format!("{template_id}.json")))
    }

    fn decode(&self, template_id: &str, content: &str) -> Result<WorkflowState, StorageError> {
        let envelope: SnapshotEnvelope = serde_json::from_str(content).map_err(|e| {
            StorageError::Corrupted(format!("snapshot for '{template_id}' is unreadable: {e}"))
        })?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(StorageError::Corrupted(format!(
                "snapshot for '{template_id}' has unsupported version {}",
                envelope.version
            )));
        }
        if !self.hasher.verify(&envelope.state.to_string(), &envelope.checksum) {
            return Err(StorageError::Corrupted(format!(
                "snapshot for '{template_id}' failed checksum verification"
            )));
        }
        serde_json::from_value(envelope.state).map_err(|e| {
            StorageError::Corrupted(format!("snapshot for '{template_id}' has an invalid state: {e}"))
        })
    }
}

impl StateRepository for FileStateRepository {
    async fn load(&self, template_id: &str) -> Result<Option<WorkflowState>, StorageError> {
        let path = self.path_for(template_id)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        self.decode(template_id, &content).map(Some)
    }

    async fn save(&self, state: &WorkflowState) -> Result<(), StorageError> {
        let template_id = snapshot_key(state)?;
        let path = self.path_for(template_id)?;

        let state = serde_json::to_value(state)?;
        let envelope = SnapshotEnvelope {
            version: ENVELOPE_VERSION,
            checksum: self.hasher.compute_hash(&state.to_string()),
            saved_at: Utc::now(),
            state,
        };
        let bytes = serde_json::to_vec_pretty(&envelope)?;
        write_atomic(&path, &bytes).await?;
        tracing::debug!(template_id, path = %path.display(), "state snapshot written");
        Ok(())
    }

    async fn delete(&self, template_id: &str) -> Result<bool, StorageError> {
        let path = self.path_for(template_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use checkflow_types::state::WorkflowStatus;
    use checkflow_types::value::{Value, Variables};
    use tempfile::TempDir;

    fn state(template_id: &str) -> WorkflowState {
        let mut vars = Variables::new();
        vars.insert("env".to_string(), Value::from("prod"));
        vars.insert("replicas".to_string(), Value::from(3));
        let mut state = WorkflowState::new(template_id, vars);
        state.status = WorkflowStatus::Active;
        state.current_step_index = 1;
        state.started_at = Some(Utc::now());
        state
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let repo = FileStateRepository::new(dir.path().join("state"));
        let saved = state("release");

        repo.save(&saved).await.unwrap();
        let loaded = repo.load("release").await.unwrap();

        assert_eq!(loaded, Some(saved));
    }

    #[tokio::test]
    async fn test_load_missing_returns_none() {
        let dir = TempDir::new().unwrap();
        let repo = FileStateRepository::new(dir.path());
        assert!(repo.load("nothing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tampered_snapshot_is_corrupted() {
        let dir = TempDir::new().unwrap();
        let repo = FileStateRepository::new(dir.path());
        repo.save(&state("release")).await.unwrap();

        let path = repo.path_for("release").unwrap();
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let tampered = content.replace("\"currentStepIndex\": 1", "\"currentStepIndex\": 2");
        assert_ne!(content, tampered);
        tokio::fs::write(&path, tampered).await.unwrap();

        let err = repo.load("release").await.unwrap_err();
        assert!(matches!(err, StorageError::Corrupted(_)));
    }

    #[tokio::test]
    async fn test_unparseable_snapshot_is_corrupted() {
        let dir = TempDir::new().unwrap();
        let repo = FileStateRepository::new(dir.path());
        tokio::fs::write(repo.path_for("release").unwrap(), "{ not json")
            .await
            .unwrap();

        let err = repo.load("release").await.unwrap_err();
        assert!(matches!(err, StorageError::Corrupted(_)));
    }

    #[tokio::test]
    async fn test_delete() {
        let dir = TempDir::new().unwrap();
        let repo = FileStateRepository::new(dir.path());
        repo.save(&state("release")).await.unwrap();

        assert!(repo.delete("release").await.unwrap());
        assert!(!repo.delete("release").await.unwrap());
        assert!(repo.load("release").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_path_traversal_is_rejected() {
        let dir = TempDir::new().unwrap();
        let repo = FileStateRepository::new(dir.path());
        assert!(repo.load("../escape").await.is_err());
        assert!(repo.save(&state("../escape")).await.is_err());
    }
}
