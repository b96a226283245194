//! Application state wiring the engine to its file-backed adapters.
//!
//! `WorkflowEngine` is generic over its ports; `AppState` pins it to the
//! concrete infra implementations under the data directory.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use checkflow_core::state::StateStore;
use checkflow_core::workflow::{EngineOptions, WorkflowEngine};
use checkflow_infra::config::load_config;
use checkflow_infra::filesystem::{DataLayout, resolve_data_dir};
use checkflow_infra::state::FileStateRepository;
use checkflow_infra::template::FileTemplateSource;
use checkflow_infra::validation::DefaultStepValidator;
use checkflow_infra::wal::FileWal;
use checkflow_types::config::CheckflowConfig;

/// Engine generics pinned to infra implementations.
pub type ConcreteEngine =
    WorkflowEngine<FileStateRepository, FileWal, FileTemplateSource, DefaultStepValidator>;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ConcreteEngine>,
    pub templates: FileTemplateSource,
    pub config: CheckflowConfig,
    pub layout: DataLayout,
}

impl AppState {
    /// Resolve the data directory, load config and open the WAL.
    pub async fn init(data_dir: Option<PathBuf>) -> anyhow::Result<Self> {
        let data_dir = data_dir.unwrap_or_else(resolve_data_dir);
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let config = load_config(&data_dir).await;
        let layout = DataLayout::new(data_dir);

        let wal = FileWal::open(layout.wal_path(), config.wal_sync)
            .await
            .with_context(|| format!("Failed to open WAL at {}", layout.wal_path().display()))?;
        let templates = FileTemplateSource::new(layout.template_dir(&config));
        let store = StateStore::new(
            FileStateRepository::new(layout.state_dir()),
            wal,
            templates.clone(),
        );

        let working_dir = std::env::current_dir().context("Failed to read current directory")?;
        let engine = WorkflowEngine::new(
            store,
            DefaultStepValidator::from_config(&config),
            EngineOptions::from_config(&config, working_dir),
        );

        tracing::debug!(data_dir = %layout.root().display(), "application state ready");
        Ok(Self {
            engine: Arc::new(engine),
            templates,
            config,
            layout,
        })
    }
}
