//! Data directory layout and file helpers.
//!
//! ```text
//! {data_dir}/
//!   config.toml
//!   state/{template_id}.json
//!   wal/checkflow.wal
//!   templates/{template_id}.{yaml,yml,json}
//! ```

use std::path::{Path, PathBuf};

use checkflow_types::config::CheckflowConfig;
use tokio::io::AsyncWriteExt;

/// Paths under a Checkflow data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one snapshot per template.
    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn wal_path(&self) -> PathBuf {
        self.root.join("wal").join("checkflow.wal")
    }

    /// `config.template_dir` when set, else `{data_dir}/templates`.
    pub fn template_dir(&self, config: &CheckflowConfig) -> PathBuf {
        config
            .template_dir
            .clone()
            .unwrap_or_else(|| self.root.join("templates"))
    }
}

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `CHECKFLOW_DATA_DIR` environment variable
/// 2. `~/.checkflow`
/// 3. `./.checkflow`
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CHECKFLOW_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".checkflow");
    }

    PathBuf::from(".checkflow")
}

/// Reject ids that would escape their directory when used as a file stem.
pub fn check_file_stem(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("id must not be empty".to_string());
    }
    if id.contains(['/', '\\']) || id == "." || id == ".." || id.contains('\0') {
        return Err(format!("'{id}' is not a valid file name"));
    }
    Ok(())
}

/// Write `bytes` to `path` through a synced temp file and a rename.
///
/// Readers see either the old content or the new content, never a mix.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = temp_path(path);
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
