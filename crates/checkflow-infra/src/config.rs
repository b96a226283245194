//! Configuration loader for Checkflow.
//!
//! Reads `config.toml` from the data directory (`~/.checkflow/` in
//! production) and deserializes it into [`CheckflowConfig`]. Falls back to
//! defaults when the file is missing or malformed.

use std::path::Path;

use checkflow_types::config::CheckflowConfig;

/// Load configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`CheckflowConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
pub async fn load_config(data_dir: &Path) -> CheckflowConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return CheckflowConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return CheckflowConfig::default();
        }
    };

    match toml::from_str::<CheckflowConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            CheckflowConfig::default()
        }
    }
}
