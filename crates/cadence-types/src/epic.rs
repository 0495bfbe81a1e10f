//! Epic domain types: a batch of dependent work items (stories).
//!
//! An `Epic` is parsed from a declarative document; `EpicState` is the
//! persisted progress of one run over it, and `ItemSummary` is the compact
//! per-item record appended to the cross-run memory log.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Definition
// ---------------------------------------------------------------------------

/// A batch of items executed in dependency order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Epic {
    pub id: String,
    pub title: String,
    pub items: Vec<Item>,
}

/// One unit of work in an epic, identified by a composite `epic.story` id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Item {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Ids of items that must be done before this one starts.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub status: ItemStatus,
}

impl Item {
    /// The story part of the composite id (`"3.2"` -> `"2"`).
    pub fn story_number(&self) -> &str {
        self.id.split_once('.').map_or(self.id.as_str(), |(_, story)| story)
    }
}

/// Progress of a single item.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    NotStarted,
    InProgress,
    Done,
    Blocked,
    Failed,
}

impl ItemStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::NotStarted => "not_started",
            ItemStatus::InProgress => "in_progress",
            ItemStatus::Done => "done",
            ItemStatus::Blocked => "blocked",
            ItemStatus::Failed => "failed",
        }
    }

    /// Whether dependents of an item in this status can never run.
    pub fn blocks_dependents(self) -> bool {
        matches!(self, ItemStatus::Failed | ItemStatus::Blocked)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Quality gate
// ---------------------------------------------------------------------------

/// Result of the quality gate collaborator for one item iteration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GateVerdict {
    pub passed: bool,
    #[serde(default)]
    pub scores: BTreeMap<String, f64>,
}

impl GateVerdict {
    /// Lowest reported score, if any were reported.
    pub fn min_score(&self) -> Option<f64> {
        self.scores.values().copied().reduce(f64::min)
    }
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

/// Per-item bookkeeping inside an epic run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemProgress {
    pub status: ItemStatus,
    /// Quality iterations attempted so far.
    #[serde(default)]
    pub iterations: u32,
    /// Workflow run ids of every sub-run, in order.
    #[serde(default)]
    pub workflow_ids: Vec<String>,
    #[serde(default)]
    pub last_scores: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Persisted progress of one epic run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpicState {
    pub epic_id: String,
    pub title: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Resolved execution order.
    pub execution_order: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_item: Option<String>,
    /// Progress keyed by item id.
    pub items: BTreeMap<String, ItemProgress>,
}

impl EpicState {
    pub fn status_of(&self, item_id: &str) -> ItemStatus {
        self.items
            .get(item_id)
            .map(|p| p.status)
            .unwrap_or_default()
    }
}

/// Compact per-item record appended to the memory log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSummary {
    pub epic_id: String,
    pub item_id: String,
    pub title: String,
    pub status: ItemStatus,
    pub iterations: u32,
    #[serde(default)]
    pub scores: BTreeMap<String, f64>,
    #[serde(default)]
    pub workflow_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// End-of-run report over an epic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionReport {
    pub epic_id: String,
    pub total: usize,
    pub counts: BTreeMap<ItemStatus, usize>,
    /// `done / total * 100`, 0 for an empty epic.
    pub completion_percentage: f64,
    pub execution_order: Vec<String>,
}

impl CompletionReport {
    pub fn count(&self, status: ItemStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.count(ItemStatus::Done) == self.total
    }
}
