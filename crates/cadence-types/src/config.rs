//! Configuration types for Cadence.
//!
//! `CadenceConfig` represents the top-level `config.toml`. Every field has a
//! default so an empty or partial file is valid.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration, loaded from `{data_dir}/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub epic: EpicConfig,
    #[serde(default)]
    pub retention: RetentionPolicy,
}

/// State store settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateConfig {
    /// Override for the state directory (default `{data_dir}/state`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    /// Gzip-compress persisted documents.
    #[serde(default)]
    pub compress: bool,
}

/// Workflow engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Ceiling on advancements per `execute` call.
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    /// Default timeout around each agent call, in seconds.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
}

fn default_max_steps() -> u32 {
    50
}

fn default_step_timeout_secs() -> u64 {
    300
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            step_timeout_secs: default_step_timeout_secs(),
        }
    }
}

/// Epic execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpicConfig {
    /// Quality-gate iterations per item before it is marked failed.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Minimum score for ordinary items.
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,
    /// Minimum score for items flagged critical.
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: f64,
    /// Case-insensitive keywords that flag an item as critical.
    #[serde(default = "default_critical_keywords")]
    pub critical_keywords: Vec<String>,
    /// Agent invoked to improve a failing artifact between iterations.
    #[serde(default = "default_improver_agent")]
    pub improver_agent: String,
}

fn default_max_iterations() -> u32 {
    3
}

fn default_quality_threshold() -> f64 {
    7.0
}

fn default_critical_threshold() -> f64 {
    9.0
}

fn default_critical_keywords() -> Vec<String> {
    ["auth", "security", "payment", "database", "credential", "encryption"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_improver_agent() -> String {
    "improver".to_string()
}

impl Default for EpicConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            quality_threshold: default_quality_threshold(),
            critical_threshold: default_critical_threshold(),
            critical_keywords: default_critical_keywords(),
            improver_agent: default_improver_agent(),
        }
    }
}

/// Age- and count-based retention for persisted records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Remove records last saved more than this many days ago.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_days: Option<u32>,
    /// Keep at most this many records (newest first).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_last: Option<usize>,
    /// Move removed records into `archive/` instead of deleting them.
    #[serde(default)]
    pub archive: bool,
}

impl RetentionPolicy {
    pub fn is_noop(&self) -> bool {
        self.max_age_days.is_none() && self.keep_last.is_none()
    }
}
