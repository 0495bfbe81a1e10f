//! Configuration loader for Cadence.
//!
//! Reads `config.toml` from the data directory (`~/.cadence/` in production)
//! and deserializes it into [`CadenceConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::{Path, PathBuf};

use cadence_types::config::CadenceConfig;

/// Load configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`CadenceConfig::default()`].
/// - If the file exists but fails to read or parse, logs a warning and
///   returns the default.
pub async fn load_config(data_dir: &Path) -> CadenceConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %config_path.display(), "no config.toml found, using defaults");
            return CadenceConfig::default();
        }
        Err(err) => {
            tracing::warn!(path = %config_path.display(), error = %err, "failed to read config, using defaults");
            return CadenceConfig::default();
        }
    };

    match toml::from_str::<CadenceConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(path = %config_path.display(), error = %err, "failed to parse config, using defaults");
            CadenceConfig::default()
        }
    }
}

/// Directory holding workflow state records.
///
/// A relative `[state] dir` override is taken relative to `data_dir`.
pub fn state_dir(data_dir: &Path, config: &CadenceConfig) -> PathBuf {
    match &config.state.dir {
        Some(dir) if dir.is_absolute() => dir.clone(),
        Some(dir) => data_dir.join(dir),
        None => data_dir.join("state"),
    }
}

/// Directory holding per-epic state, memory logs and handoff documents.
pub fn epics_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("epics")
}
