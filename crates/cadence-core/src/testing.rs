//! Shared fixtures for unit tests.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::Duration;

use cadence_types::workflow::{
    Artifact, ArtifactStatus, Gate, StepDefinition, WorkflowDefinition, WorkflowState,
};
use chrono::{TimeZone, Utc};
use serde_json::json;

use crate::service::hash::ContentHasher;
use crate::workflow::agent::{AgentError, AgentExecutor, AgentRequest, StepOutcome};

/// Deterministic, non-cryptographic hasher.
pub struct TestHasher;

impl ContentHasher for TestHasher {
    fn compute_hash(&self, content: &str) -> String {
        let mut hasher = DefaultHasher::new();
        content.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}

/// A mid-run state with artifacts, variables and a skipped step.
pub fn sample_state() -> WorkflowState {
    let started = Utc.with_ymd_and_hms(2026, 4, 1, 9, 0, 0).unwrap();
    let mut state = WorkflowState::new("story-flow-0001".into(), started, "implement".into());
    state.record_completed("plan");
    state.record_skipped("enhance");
    state.artifacts.insert(
        "plan".into(),
        Artifact {
            path: "docs/plan.md".into(),
            status: ArtifactStatus::Approved,
            created_by: "plan".into(),
            created_at: started,
            metadata: BTreeMap::new(),
        },
    );
    state.set_var("workflow.name", json!("story-flow"));
    state.set_var("input.story", json!("3.2"));
    state
}

/// Step `id` run by agent `agent-{id}`.
pub fn step(id: &str, next: Option<&str>) -> StepDefinition {
    StepDefinition {
        id: id.into(),
        agent_ref: format!("agent-{id}"),
        action: format!("do-{id}"),
        requires: vec![],
        creates: vec![],
        next: next.map(String::from),
        gate: None,
        repeats: false,
        timeout_secs: None,
    }
}

/// Step with a gate on `outputs.approved`.
pub fn gated_step(id: &str, on_pass: &str, on_fail: &str) -> StepDefinition {
    StepDefinition {
        gate: Some(Gate {
            condition: "outputs.approved == true".into(),
            on_pass: on_pass.into(),
            on_fail: on_fail.into(),
        }),
        repeats: true,
        ..step(id, None)
    }
}

/// Workflow `linear` chaining `ids` in order.
pub fn linear_definition(ids: &[&str]) -> WorkflowDefinition {
    let steps = ids
        .iter()
        .enumerate()
        .map(|(i, id)| step(id, ids.get(i + 1).copied()))
        .collect();
    WorkflowDefinition {
        name: "linear".into(),
        description: None,
        version: None,
        steps,
    }
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

/// Replays scripted outcomes; the last one repeats forever.
pub struct ScriptedAgent {
    id: String,
    script: Mutex<VecDeque<Result<StepOutcome, String>>>,
    last: Result<StepOutcome, String>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedAgent {
    pub fn always(id: &str, outcome: StepOutcome) -> Self {
        Self::sequence(id, vec![Ok(outcome)])
    }

    pub fn sequence(id: &str, mut script: Vec<Result<StepOutcome, String>>) -> Self {
        let last = script.pop().unwrap_or_else(|| Ok(StepOutcome::default()));
        Self {
            id: id.into(),
            script: Mutex::new(script.into()),
            last,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Step ids this agent was dispatched for, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl AgentExecutor for ScriptedAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, request: &AgentRequest) -> Result<StepOutcome, AgentError> {
        self.calls.lock().unwrap().push(request.step.id.clone());
        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.last.clone());
        next.map_err(AgentError::Failed)
    }
}

pub struct FailingAgent {
    id: String,
    message: String,
}

impl FailingAgent {
    pub fn new(id: &str, message: &str) -> Self {
        Self {
            id: id.into(),
            message: message.into(),
        }
    }
}

impl AgentExecutor for FailingAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, _request: &AgentRequest) -> Result<StepOutcome, AgentError> {
        Err(AgentError::Failed(self.message.clone()))
    }
}

pub struct SlowAgent {
    id: String,
    delay: Duration,
}

impl SlowAgent {
    pub fn new(id: &str, delay: Duration) -> Self {
        Self {
            id: id.into(),
            delay,
        }
    }
}

impl AgentExecutor for SlowAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, _request: &AgentRequest) -> Result<StepOutcome, AgentError> {
        tokio::time::sleep(self.delay).await;
        Ok(StepOutcome::default())
    }
}
