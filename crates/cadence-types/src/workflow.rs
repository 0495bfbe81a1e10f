//! Workflow domain types for Cadence.
//!
//! Defines the declarative step graph (`WorkflowDefinition` / `StepDefinition`)
//! and the mutable, single-owner execution record (`WorkflowState`) that the
//! engine checkpoints after every transition.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Reserved routing keywords
// ---------------------------------------------------------------------------

/// Gate target meaning "continue with the step's own `next`".
pub const ROUTE_NEXT: &str = "next";

/// Gate target meaning "run the same step again".
pub const ROUTE_RETRY: &str = "retry";

/// Returns `true` if `target` is a reserved routing keyword rather than a step id.
pub fn is_reserved_route(target: &str) -> bool {
    target == ROUTE_NEXT || target == ROUTE_RETRY
}

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A declarative workflow: an ordered list of steps forming a near-linear chain.
///
/// The first step in definition order is the entry point. Loaded once and
/// never mutated during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowDefinition {
    /// Workflow name (alphanumeric, hyphens and underscores).
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Optional semantic version string (e.g. "1.2.0").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Steps in definition order.
    pub steps: Vec<StepDefinition>,
}

impl WorkflowDefinition {
    /// Look up a step by id.
    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// The entry step (first in definition order).
    pub fn first_step(&self) -> Option<&StepDefinition> {
        self.steps.first()
    }
}

/// A single step in a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StepDefinition {
    /// Step id, unique within the workflow.
    pub id: String,
    /// Id of the agent that executes this step (looked up in the agent registry).
    #[serde(rename = "agent")]
    pub agent_ref: String,
    /// Action name passed to the agent.
    pub action: String,
    /// Artifact names that must exist before this step can run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
    /// Artifact names this step is expected to produce.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub creates: Vec<String>,
    /// Default continuation. `None` means the workflow completes after this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    /// Optional pass/fail branch point. Overrides `next` when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<Gate>,
    /// Whether the step may legitimately run more than once in a run.
    #[serde(default)]
    pub repeats: bool,
    /// Step-level timeout in seconds (engine default when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// A pass/fail decision point.
///
/// `on_pass` / `on_fail` name a step id or one of the reserved keywords
/// [`ROUTE_NEXT`] and [`ROUTE_RETRY`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Gate {
    /// JEXL expression evaluated against `{ step, outputs, variables }`.
    pub condition: String,
    pub on_pass: String,
    pub on_fail: String,
}

// ---------------------------------------------------------------------------
// Workflow State
// ---------------------------------------------------------------------------

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Paused,
    Completed,
    Failed,
}

impl WorkflowStatus {
    /// All status values, in declaration order.
    pub const ALL: [WorkflowStatus; 4] = [
        WorkflowStatus::Running,
        WorkflowStatus::Paused,
        WorkflowStatus::Completed,
        WorkflowStatus::Failed,
    ];

    /// Status values that carry a `current_step`.
    pub fn is_active(self) -> bool {
        matches!(self, WorkflowStatus::Running | WorkflowStatus::Paused)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::Running => "running",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
        }
    }

    /// Parse the persisted string form.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a produced artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Draft,
    Ready,
    Approved,
    Rejected,
}

/// A named work product recorded in the workflow state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Path of the artifact on disk (relative to the project root).
    pub path: String,
    pub status: ArtifactStatus,
    /// Id of the step that produced it.
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// The mutable execution record of one workflow run.
///
/// Invariants maintained by the engine:
/// - `current_step.is_some()` exactly when `status` is running or paused
/// - `completed_steps` has no duplicates and preserves execution order
/// - no step id is in both `completed_steps` and `skipped_steps`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    /// Unique run id (`{workflow}-{suffix}`), also the storage record id.
    pub workflow_id: String,
    pub started_at: DateTime<Utc>,
    pub current_step: Option<String>,
    pub completed_steps: Vec<String>,
    #[serde(default)]
    pub skipped_steps: BTreeSet<String>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, Artifact>,
    /// Execution context; see [`crate::variables`] for the documented keys.
    #[serde(default)]
    pub variables: BTreeMap<String, serde_json::Value>,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub error: Option<String>,
}

impl WorkflowState {
    /// Create a fresh running state positioned at `first_step`.
    pub fn new(workflow_id: String, started_at: DateTime<Utc>, first_step: String) -> Self {
        Self {
            workflow_id,
            started_at,
            current_step: Some(first_step),
            completed_steps: Vec::new(),
            skipped_steps: BTreeSet::new(),
            artifacts: BTreeMap::new(),
            variables: BTreeMap::new(),
            status: WorkflowStatus::Running,
            error: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == WorkflowStatus::Running
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, WorkflowStatus::Completed | WorkflowStatus::Failed)
    }

    pub fn is_completed(&self, step_id: &str) -> bool {
        self.completed_steps.iter().any(|s| s == step_id)
    }

    /// Append `step_id` to `completed_steps` unless already present.
    ///
    /// Returns `true` if the step was newly recorded. Completing a step also
    /// removes it from `skipped_steps`.
    pub fn record_completed(&mut self, step_id: &str) -> bool {
        self.skipped_steps.remove(step_id);
        if self.is_completed(step_id) {
            return false;
        }
        self.completed_steps.push(step_id.to_string());
        true
    }

    /// Record `step_id` as skipped unless it has already completed.
    pub fn record_skipped(&mut self, step_id: &str) -> bool {
        if self.is_completed(step_id) {
            return false;
        }
        self.skipped_steps.insert(step_id.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
