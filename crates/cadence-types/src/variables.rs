//! Typed namespace for `WorkflowState::variables`.
//!
//! The variables map is free-form, but every component that reads or writes
//! it does so through the keys declared here:
//!
//! | key                | writer        | value                         |
//! |--------------------|---------------|-------------------------------|
//! | `workflow.name`    | engine start  | definition name               |
//! | `workflow.version` | engine start  | definition version (optional) |
//! | `workflow.source`  | engine start  | definition file path          |
//! | `input.<key>`      | caller        | arbitrary run input           |
//! | `outputs.<step>`   | engine        | object of step outputs        |
//! | `gate.<step>`      | engine        | [`GateRecord`]                |
//! | `engine.failure`   | engine        | [`FailureRecord`]             |
//! | `item.id`          | epic runner   | composite item id             |
//! | `item.title`       | epic runner   | item title                    |
//! | `item.critical`    | epic runner   | bool                          |
//! | `epic.id`          | epic runner   | epic id                       |
//! | `epic.iteration`   | epic runner   | 1-based quality iteration     |

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workflow::WorkflowState;

pub const WORKFLOW_NAME: &str = "workflow.name";
pub const WORKFLOW_VERSION: &str = "workflow.version";
pub const WORKFLOW_SOURCE: &str = "workflow.source";
pub const ENGINE_FAILURE: &str = "engine.failure";
pub const ITEM_ID: &str = "item.id";
pub const ITEM_TITLE: &str = "item.title";
pub const ITEM_CRITICAL: &str = "item.critical";
pub const EPIC_ID: &str = "epic.id";
pub const EPIC_ITERATION: &str = "epic.iteration";

const INPUT_PREFIX: &str = "input.";
const OUTPUTS_PREFIX: &str = "outputs.";
const GATE_PREFIX: &str = "gate.";

/// Key holding caller-provided input `name`.
pub fn input_key(name: &str) -> String {
    format!("{INPUT_PREFIX}{name}")
}

/// Key holding the outputs object of `step_id`.
pub fn outputs_key(step_id: &str) -> String {
    format!("{OUTPUTS_PREFIX}{step_id}")
}

/// Key holding the gate decision of `step_id`.
pub fn gate_key(step_id: &str) -> String {
    format!("{GATE_PREFIX}{step_id}")
}

/// Recorded gate decision for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateRecord {
    pub passed: bool,
    /// The routing target that was taken.
    pub routed_to: Option<String>,
    /// Decider-specific detail (scores, evaluated condition, ...).
    #[serde(default)]
    pub detail: Value,
}

/// Why the engine halted a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The agent collaborator returned an error.
    Agent,
    /// The agent collaborator did not finish within the step timeout.
    Timeout,
    /// The step names an agent that is not registered.
    UnknownAgent,
    /// A gate decider asked the run to halt.
    GateHalted,
    /// The gate condition could not be evaluated.
    GateError,
    /// The step-count ceiling was reached.
    MaxStepsExceeded,
    /// The current step requires artifacts no earlier step produced.
    MissingArtifacts,
    /// The caller failed the run explicitly.
    Aborted,
}

/// Recorded reason for a failed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub step: Option<String>,
    pub message: String,
}

/// Typed accessors over the variable map.
impl WorkflowState {
    pub fn var(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    pub fn set_var(&mut self, key: impl Into<String>, value: Value) {
        self.variables.insert(key.into(), value);
    }

    /// Definition name recorded at start.
    pub fn workflow_name(&self) -> Option<&str> {
        self.var(WORKFLOW_NAME).and_then(Value::as_str)
    }

    /// Definition file recorded at start, if the definition came from disk.
    pub fn definition_source(&self) -> Option<&str> {
        self.var(WORKFLOW_SOURCE).and_then(Value::as_str)
    }

    pub fn step_outputs(&self, step_id: &str) -> Option<&Value> {
        self.var(&outputs_key(step_id))
    }

    pub fn gate_record(&self, step_id: &str) -> Option<GateRecord> {
        self.var(&gate_key(step_id))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn failure(&self) -> Option<FailureRecord> {
        self.var(ENGINE_FAILURE)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// All `input.*` entries with the prefix stripped.
    pub fn inputs(&self) -> BTreeMap<&str, &Value> {
        self.variables
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(INPUT_PREFIX).map(|name| (name, v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn test_key_builders() {
        assert_eq!(input_key("story"), "input.story");
        assert_eq!(outputs_key("review"), "outputs.review");
        assert_eq!(gate_key("review"), "gate.review");
    }

    #[test]
    fn test_typed_accessors() {
        let mut state = WorkflowState::new("wf".into(), Utc::now(), "a".into());
        state.set_var(WORKFLOW_NAME, json!("story-flow"));
        state.set_var(input_key("story"), json!("1.2"));
        state.set_var(
            gate_key("review"),
            serde_json::to_value(GateRecord {
                passed: false,
                routed_to: Some("implement".into()),
                detail: json!({ "score": 4.0 }),
            })
            .unwrap(),
        );

        assert_eq!(state.workflow_name(), Some("story-flow"));
        assert!(state.definition_source().is_none());
        assert_eq!(state.inputs().get("story"), Some(&&json!("1.2")));
        let gate = state.gate_record("review").unwrap();
        assert!(!gate.passed);
        assert_eq!(gate.routed_to.as_deref(), Some("implement"));
        assert!(state.failure().is_none());
    }

    #[test]
    fn test_failure_record_serializes_kind_snake_case() {
        let record = FailureRecord {
            kind: FailureKind::MaxStepsExceeded,
            step: Some("loop".into()),
            message: "max steps exceeded".into(),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["kind"], "max_steps_exceeded");
    }
}
