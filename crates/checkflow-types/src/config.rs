//! Global configuration types for Checkflow.
//!
//! `CheckflowConfig` represents the top-level `config.toml` in the data
//! directory. All fields have sensible defaults.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
///
/// Loaded from `~/.checkflow/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckflowConfig {
    /// Where templates are looked up (defaults to `{data_dir}/templates`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_dir: Option<PathBuf>,

    /// Timeout applied to `command` validations.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// Reason recorded when `skip` is called without one.
    #[serde(default = "default_skip_reason")]
    pub default_skip_reason: String,

    /// Durability of WAL appends.
    #[serde(default)]
    pub wal_sync: WalSyncMode,

    /// Maximum nesting the condition evaluator will descend into.
    #[serde(default = "default_max_condition_depth")]
    pub max_condition_depth: usize,
}

fn default_command_timeout_secs() -> u64 {
    30
}

fn default_skip_reason() -> String {
    "Skipped by user".to_string()
}

fn default_max_condition_depth() -> usize {
    64
}

impl Default for CheckflowConfig {
    fn default() -> Self {
        Self {
            template_dir: None,
            command_timeout_secs: default_command_timeout_secs(),
            default_skip_reason: default_skip_reason(),
            wal_sync: WalSyncMode::default(),
            max_condition_depth: default_max_condition_depth(),
        }
    }
}

/// Sync mode for WAL appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalSyncMode {
    /// fsync after every append.
    #[default]
    Immediate,
    /// Leave flushing to the OS.
    OsManaged,
}
