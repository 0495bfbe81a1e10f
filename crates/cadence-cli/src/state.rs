//! Application state wiring the file-backed adapters together.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;

use cadence_infra::config::{epics_dir, load_config, state_dir};
use cadence_infra::crypto::hash::Sha256ContentHasher;
use cadence_infra::filesystem::epic_repository::FileEpicRepository;
use cadence_infra::filesystem::resolve_data_dir;
use cadence_infra::filesystem::state_store::FileStateStore;
use cadence_types::config::CadenceConfig;

/// Concrete adapters shared by every command.
pub struct AppState {
    pub config: CadenceConfig,
    pub store: FileStateStore,
    pub epics: FileEpicRepository,
}

impl AppState {
    /// Resolve the data directory, load `config.toml`, and open the stores.
    pub async fn init(data_dir: Option<PathBuf>) -> anyhow::Result<Self> {
        let data_dir = data_dir.unwrap_or_else(resolve_data_dir);
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let config = load_config(&data_dir).await;
        let store = FileStateStore::new(
            state_dir(&data_dir, &config),
            Arc::new(Sha256ContentHasher::new()),
        )
        .with_compression(config.state.compress);
        let epics = FileEpicRepository::new(epics_dir(&data_dir));

        tracing::debug!(data_dir = %data_dir.display(), "initialized application state");
        Ok(Self {
            config,
            store,
            epics,
        })
    }
}
