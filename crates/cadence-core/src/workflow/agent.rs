//! Agent collaborator port: the opaque callable that turns a step into work.
//!
//! `AgentExecutor` uses RPITIT and so cannot be a trait object. Dynamic
//! dispatch follows the usual blanket-impl pattern:
//! 1. Object-safe `AgentExecutorDyn` with boxed futures
//! 2. Blanket impl of `AgentExecutorDyn` for every `T: AgentExecutor`
//! 3. `BoxAgent` wraps `Box<dyn AgentExecutorDyn>` and delegates
//!
//! `AgentRegistry` maps agent ids to boxed executors, populated at startup.
//! An unknown id is a lookup miss the engine reports, never a dynamic load.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;

use cadence_types::workflow::{Artifact, ArtifactStatus, StepDefinition};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Request / outcome
// ---------------------------------------------------------------------------

/// Everything an agent sees when asked to execute a step.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub workflow_id: String,
    pub step: StepDefinition,
    /// Snapshot of the run's variables at dispatch time.
    pub variables: BTreeMap<String, Value>,
    /// Snapshot of the run's artifacts at dispatch time.
    pub artifacts: BTreeMap<String, Artifact>,
}

/// An artifact reported by an agent. The engine stamps the producing step
/// and the creation time when merging it into the state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducedArtifact {
    pub path: String,
    pub status: ArtifactStatus,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl ProducedArtifact {
    pub fn ready(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            status: ArtifactStatus::Ready,
            metadata: BTreeMap::new(),
        }
    }
}

/// Result of a successfully executed step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutcome {
    /// Stored under `outputs.<step>` in the run's variables.
    pub outputs: Map<String, Value>,
    pub artifacts: BTreeMap<String, ProducedArtifact>,
    /// Explicit gate decision. When `None`, a gated step's condition is
    /// evaluated instead.
    pub gate_passed: Option<bool>,
}

impl StepOutcome {
    pub fn with_output(mut self, key: impl Into<String>, value: Value) -> Self {
        self.outputs.insert(key.into(), value);
        self
    }

    pub fn with_artifact(mut self, name: impl Into<String>, artifact: ProducedArtifact) -> Self {
        self.artifacts.insert(name.into(), artifact);
        self
    }

    pub fn with_gate(mut self, passed: bool) -> Self {
        self.gate_passed = Some(passed);
        self
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent failed: {0}")]
    Failed(String),

    #[error("agent rejected request: {0}")]
    InvalidRequest(String),
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// An executor for one agent id.
pub trait AgentExecutor: Send + Sync {
    /// Registry key; matched against `StepDefinition::agent_ref`.
    fn id(&self) -> &str;

    fn execute(
        &self,
        request: &AgentRequest,
    ) -> impl Future<Output = Result<StepOutcome, AgentError>> + Send;
}

impl<T: AgentExecutor> AgentExecutor for std::sync::Arc<T> {
    fn id(&self) -> &str {
        (**self).id()
    }

    fn execute(
        &self,
        request: &AgentRequest,
    ) -> impl Future<Output = Result<StepOutcome, AgentError>> + Send {
        (**self).execute(request)
    }
}

/// Object-safe version of [`AgentExecutor`] with boxed futures.
pub trait AgentExecutorDyn: Send + Sync {
    fn id(&self) -> &str;

    fn execute_boxed<'a>(
        &'a self,
        request: &'a AgentRequest,
    ) -> BoxFuture<'a, Result<StepOutcome, AgentError>>;
}

impl<T: AgentExecutor> AgentExecutorDyn for T {
    fn id(&self) -> &str {
        AgentExecutor::id(self)
    }

    fn execute_boxed<'a>(
        &'a self,
        request: &'a AgentRequest,
    ) -> BoxFuture<'a, Result<StepOutcome, AgentError>> {
        Box::pin(self.execute(request))
    }
}

/// Type-erased agent for registry storage.
pub struct BoxAgent {
    inner: Box<dyn AgentExecutorDyn + Send + Sync>,
}

impl BoxAgent {
    pub fn new<T: AgentExecutor + 'static>(agent: T) -> Self {
        Self {
            inner: Box::new(agent),
        }
    }

    pub fn id(&self) -> &str {
        self.inner.id()
    }

    pub async fn execute(&self, request: &AgentRequest) -> Result<StepOutcome, AgentError> {
        self.inner.execute_boxed(request).await
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Agents available to a run, indexed by id.
#[derive(Default)]
pub struct AgentRegistry {
    agents: HashMap<String, BoxAgent>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `agent` under its own id, replacing any previous entry.
    pub fn register<T: AgentExecutor + 'static>(&mut self, agent: T) {
        let agent = BoxAgent::new(agent);
        self.agents.insert(agent.id().to_string(), agent);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<T: AgentExecutor + 'static>(mut self, agent: T) -> Self {
        self.register(agent);
        self
    }

    pub fn get(&self, id: &str) -> Option<&BoxAgent> {
        self.agents.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.agents.contains_key(id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.agents.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Agent ids referenced by `steps` that are not registered.
    pub fn missing_for<'a>(&self, steps: &'a [StepDefinition]) -> Vec<&'a str> {
        let mut missing: Vec<&str> = steps
            .iter()
            .map(|s| s.agent_ref.as_str())
            .filter(|id| !self.contains(id))
            .collect();
        missing.dedup();
        missing
    }
}
