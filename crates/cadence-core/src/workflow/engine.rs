//! The step state machine.
//!
//! `WorkflowEngine` owns one `WorkflowState` and is its only writer. Every
//! transition (start, advance, skip, fail, pause) mutates the state and then
//! persists it through the `StateStore` before returning, so no caller can
//! observe a decided-but-unpersisted state.
//!
//! Agent and gate failures never escape as errors: they fail the run, record
//! a `FailureRecord` under `engine.failure`, persist, and return the failed
//! state. `Err` is reserved for persistence and caller misuse.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use cadence_types::config::EngineConfig;
use cadence_types::error::StateError;
use cadence_types::variables::{
    self, ENGINE_FAILURE, FailureKind, FailureRecord, GateRecord, WORKFLOW_NAME, WORKFLOW_SOURCE,
    WORKFLOW_VERSION,
};
use cadence_types::workflow::{
    Artifact, StepDefinition, WorkflowDefinition, WorkflowState, WorkflowStatus,
};
use serde_json::{Value, json};
use thiserror::Error;
use uuid::Uuid;

use super::agent::{AgentRegistry, AgentRequest, StepOutcome};
use super::definition::WorkflowError;
use super::gate::{ExpressionGate, GateDecider, GateInput};
use super::graph::StepGraph;
use crate::service::clock::{Clock, SystemClock};
use crate::state::StateStore;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("workflow definition error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("workflow has not been started or resumed")]
    NotStarted,

    #[error("workflow already has an active state")]
    AlreadyStarted,

    #[error("cannot {action} a workflow in status '{status}'")]
    InvalidStatus {
        action: &'static str,
        status: WorkflowStatus,
    },

    #[error("step '{requested}' is not the current step ({current:?})")]
    StepMismatch {
        requested: String,
        current: Option<String>,
    },

    #[error("state belongs to workflow '{found}', not '{expected}'")]
    DefinitionMismatch { expected: String, found: String },

    #[error("state references step '{0}' which the definition does not contain")]
    UnknownStep(String),
}

// ---------------------------------------------------------------------------
// Start request
// ---------------------------------------------------------------------------

/// Parameters of a new run.
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    /// Prefix of the generated workflow id (defaults to the definition name).
    pub id_prefix: Option<String>,
    /// Path the definition was loaded from, recorded for resume.
    pub source: Option<String>,
    /// Caller inputs, stored as `input.<key>`.
    pub inputs: BTreeMap<String, Value>,
    /// Additional variables stored verbatim (namespaced keys).
    pub variables: BTreeMap<String, Value>,
}

impl StartRequest {
    pub fn with_input(mut self, key: impl AsRef<str>, value: Value) -> Self {
        self.inputs.insert(key.as_ref().to_string(), value);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Sequential executor for one workflow run.
pub struct WorkflowEngine<S: StateStore> {
    store: Arc<S>,
    graph: StepGraph,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    default_gate: ExpressionGate,
    state: Option<WorkflowState>,
}

impl<S: StateStore> WorkflowEngine<S> {
    /// Validate `definition` and build an idle engine.
    pub fn new(store: Arc<S>, definition: WorkflowDefinition) -> Result<Self, EngineError> {
        Ok(Self {
            store,
            graph: StepGraph::new(definition)?,
            clock: Arc::new(SystemClock),
            config: EngineConfig::default(),
            default_gate: ExpressionGate::new(),
            state: None,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn graph(&self) -> &StepGraph {
        &self.graph
    }

    pub fn state(&self) -> Option<&WorkflowState> {
        self.state.as_ref()
    }

    pub fn into_state(self) -> Option<WorkflowState> {
        self.state
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Create a running state positioned at the first step and persist it.
    pub async fn start(&mut self, request: StartRequest) -> Result<&WorkflowState, EngineError> {
        if self.state.as_ref().is_some_and(|s| !s.is_terminal()) {
            return Err(EngineError::AlreadyStarted);
        }

        let definition = self.graph.definition();
        let prefix = request.id_prefix.as_deref().unwrap_or(&definition.name);
        let workflow_id = format!("{prefix}-{}", Uuid::now_v7().simple());
        let mut state = WorkflowState::new(
            workflow_id,
            self.clock.now(),
            self.graph.first_step().id.clone(),
        );

        state.set_var(WORKFLOW_NAME, json!(definition.name));
        if let Some(version) = &definition.version {
            state.set_var(WORKFLOW_VERSION, json!(version));
        }
        if let Some(source) = request.source {
            state.set_var(WORKFLOW_SOURCE, json!(source));
        }
        for (key, value) in request.inputs {
            state.set_var(variables::input_key(&key), value);
        }
        for (key, value) in request.variables {
            state.set_var(key, value);
        }

        tracing::info!(
            workflow_id = %state.workflow_id,
            workflow = %definition.name,
            first_step = ?state.current_step,
            "workflow started"
        );
        self.state = Some(state);
        self.persist().await
    }

    /// Load a persisted run of this definition. `None` loads the most
    /// recently written record.
    pub async fn resume(&mut self, selector: Option<&str>) -> Result<&WorkflowState, EngineError> {
        let (state, meta) = self.store.load(selector).await?;

        let found = state.workflow_name().unwrap_or_default();
        if found != self.graph.name() {
            return Err(EngineError::DefinitionMismatch {
                expected: self.graph.name().to_string(),
                found: found.to_string(),
            });
        }
        if let Some(step) = &state.current_step {
            if !self.graph.contains(step) {
                return Err(EngineError::UnknownStep(step.clone()));
            }
        }

        tracing::info!(
            workflow_id = %state.workflow_id,
            current_step = ?state.current_step,
            status = %state.status,
            saved_at = %meta.saved_at,
            "workflow resumed"
        );
        Ok(&*self.state.insert(state))
    }

    /// Definition of the step the run is positioned at.
    pub fn current_step(&self) -> Option<&StepDefinition> {
        self.state
            .as_ref()?
            .current_step
            .as_deref()
            .and_then(|id| self.graph.step(id))
    }

    /// Whether the current step can run: the run is active and every artifact
    /// the step requires exists.
    pub fn can_proceed(&self) -> bool {
        let (Some(state), Some(_)) = (self.state.as_ref(), self.current_step()) else {
            return false;
        };
        state.is_running() && self.missing_artifacts().is_empty()
    }

    /// Artifacts the current step requires that the run has not produced.
    pub fn missing_artifacts(&self) -> Vec<String> {
        let (Some(state), Some(step)) = (self.state.as_ref(), self.current_step()) else {
            return Vec::new();
        };
        step.requires
            .iter()
            .filter(|name| !state.artifacts.contains_key(name.as_str()))
            .cloned()
            .collect()
    }

    pub async fn pause(&mut self) -> Result<&WorkflowState, EngineError> {
        let state = self.running_state_mut("pause")?;
        state.status = WorkflowStatus::Paused;
        tracing::info!(workflow_id = %state.workflow_id, "workflow paused");
        self.persist().await
    }

    pub async fn unpause(&mut self) -> Result<&WorkflowState, EngineError> {
        let state = self.state.as_mut().ok_or(EngineError::NotStarted)?;
        if state.status != WorkflowStatus::Paused {
            return Err(EngineError::InvalidStatus {
                action: "unpause",
                status: state.status,
            });
        }
        state.status = WorkflowStatus::Running;
        tracing::info!(workflow_id = %state.workflow_id, "workflow unpaused");
        self.persist().await
    }

    /// Fail the run on behalf of the caller.
    pub async fn fail(&mut self, reason: impl Into<String>) -> Result<&WorkflowState, EngineError> {
        let state = self.state.as_ref().ok_or(EngineError::NotStarted)?;
        if state.is_terminal() {
            return Err(EngineError::InvalidStatus {
                action: "fail",
                status: state.status,
            });
        }
        let step = state.current_step.clone();
        self.fail_run(FailureKind::Aborted, step, reason.into());
        self.persist().await
    }

    // -----------------------------------------------------------------------
    // Advancement
    // -----------------------------------------------------------------------

    /// Record the current step as completed and route to the next one using
    /// the default gate decider.
    ///
    /// `step_id`, when given, must name the current step.
    pub async fn advance(
        &mut self,
        step_id: Option<&str>,
        outcome: StepOutcome,
    ) -> Result<&WorkflowState, EngineError> {
        let step = self.checked_current_step("advance", step_id)?;
        self.advance_step(&step, outcome, None::<&ExpressionGate>).await
    }

    /// [`advance`](Self::advance) with a caller-supplied gate decider.
    pub async fn advance_with<D: GateDecider>(
        &mut self,
        step_id: Option<&str>,
        outcome: StepOutcome,
        decider: &D,
    ) -> Result<&WorkflowState, EngineError> {
        let step = self.checked_current_step("advance", step_id)?;
        self.advance_step(&step, outcome, Some(decider)).await
    }

    /// Mark the current step skipped and continue with its `next`. Gates are
    /// not evaluated.
    pub async fn skip(&mut self, step_id: &str) -> Result<&WorkflowState, EngineError> {
        let step = self.checked_current_step("skip", Some(step_id))?;
        let state = self.state_mut()?;
        if !state.record_skipped(&step.id) {
            tracing::debug!(step_id = %step.id, "skipping a step that already completed");
        }
        tracing::info!(workflow_id = %state.workflow_id, step_id = %step.id, "step skipped");
        self.route_to(step.next.clone());
        self.persist().await
    }

    /// Drive the run with the default gate decider.
    pub async fn execute(&mut self, agents: &AgentRegistry) -> Result<&WorkflowState, EngineError> {
        let step_budget = self.config.max_steps;
        self.run_loop(agents, None::<&ExpressionGate>, step_budget).await
    }

    /// Drive the run until it leaves the running status or the step ceiling
    /// is hit, dispatching each step to its agent.
    pub async fn execute_with<D: GateDecider>(
        &mut self,
        agents: &AgentRegistry,
        decider: &D,
    ) -> Result<&WorkflowState, EngineError> {
        let step_budget = self.config.max_steps;
        self.run_loop(agents, Some(decider), step_budget).await
    }

    async fn run_loop<D: GateDecider>(
        &mut self,
        agents: &AgentRegistry,
        decider: Option<&D>,
        max_steps: u32,
    ) -> Result<&WorkflowState, EngineError> {
        let mut advanced = 0u32;

        while self.state.as_ref().is_some_and(WorkflowState::is_running) {
            let step = self.checked_current_step("execute", None)?;

            if advanced >= max_steps {
                tracing::warn!(max_steps, step_id = %step.id, "step ceiling reached");
                self.fail_run(
                    FailureKind::MaxStepsExceeded,
                    Some(step.id.clone()),
                    format!("max steps exceeded ({max_steps})"),
                );
                return self.persist().await;
            }

            let missing = self.missing_artifacts();
            if !missing.is_empty() {
                self.fail_run(
                    FailureKind::MissingArtifacts,
                    Some(step.id.clone()),
                    format!("step '{}' requires missing artifacts: {}", step.id, missing.join(", ")),
                );
                return self.persist().await;
            }

            let Some(agent) = agents.get(&step.agent_ref) else {
                self.fail_run(
                    FailureKind::UnknownAgent,
                    Some(step.id.clone()),
                    format!("unknown agent '{}'", step.agent_ref),
                );
                return self.persist().await;
            };

            let request = {
                let state = self.state_mut()?;
                AgentRequest {
                    workflow_id: state.workflow_id.clone(),
                    step: step.clone(),
                    variables: state.variables.clone(),
                    artifacts: state.artifacts.clone(),
                }
            };
            let timeout_secs = step.timeout_secs.unwrap_or(self.config.step_timeout_secs);

            tracing::debug!(step_id = %step.id, agent = %step.agent_ref, "dispatching step");
            match tokio::time::timeout(Duration::from_secs(timeout_secs), agent.execute(&request))
                .await
            {
                Ok(Ok(outcome)) => {
                    self.advance_step(&step, outcome, decider).await?;
                    advanced += 1;
                }
                Ok(Err(e)) => {
                    self.fail_run(FailureKind::Agent, Some(step.id.clone()), e.to_string());
                    return self.persist().await;
                }
                Err(_) => {
                    self.fail_run(
                        FailureKind::Timeout,
                        Some(step.id.clone()),
                        format!("step '{}' timed out after {timeout_secs}s", step.id),
                    );
                    return self.persist().await;
                }
            }
        }

        self.state.as_ref().ok_or(EngineError::NotStarted)
    }

    async fn advance_step<D: GateDecider>(
        &mut self,
        step: &StepDefinition,
        outcome: StepOutcome,
        decider: Option<&D>,
    ) -> Result<&WorkflowState, EngineError> {
        let now = self.clock.now();
        let StepOutcome {
            outputs,
            artifacts,
            gate_passed,
        } = outcome;

        let state = self.state_mut()?;
        if !state.record_completed(&step.id) && !step.repeats {
            tracing::debug!(step_id = %step.id, "step completed again");
        }
        if !outputs.is_empty() {
            state.set_var(variables::outputs_key(&step.id), Value::Object(outputs));
        }
        for (name, produced) in artifacts {
            state.artifacts.insert(
                name,
                Artifact {
                    path: produced.path,
                    status: produced.status,
                    created_by: step.id.clone(),
                    created_at: now,
                    metadata: produced.metadata,
                },
            );
        }

        let next = match &step.gate {
            None => step.next.clone(),
            Some(gate) => {
                let state = self.state.as_ref().ok_or(EngineError::NotStarted)?;
                let input = GateInput {
                    state,
                    step,
                    gate,
                    explicit: gate_passed,
                };
                let decision = match decider {
                    Some(decider) => decider.decide(&input).await,
                    None => self.default_gate.decide(&input).await,
                };

                let decision = match decision {
                    Ok(decision) => decision,
                    Err(e) => {
                        self.fail_run(FailureKind::GateError, Some(step.id.clone()), e.to_string());
                        return self.persist().await;
                    }
                };

                if let Some(reason) = decision.halt_reason {
                    self.record_gate(step, decision.passed, None, decision.detail)?;
                    self.fail_run(FailureKind::GateHalted, Some(step.id.clone()), reason);
                    return self.persist().await;
                }

                let target = if decision.passed {
                    &gate.on_pass
                } else {
                    &gate.on_fail
                };
                let next = self.graph.resolve_route(step, target);
                tracing::info!(
                    step_id = %step.id,
                    passed = decision.passed,
                    routed_to = ?next,
                    "gate decided"
                );
                self.record_gate(step, decision.passed, next.clone(), decision.detail)?;
                next
            }
        };

        self.route_to(next);
        self.persist().await
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn state_mut(&mut self) -> Result<&mut WorkflowState, EngineError> {
        self.state.as_mut().ok_or(EngineError::NotStarted)
    }

    fn running_state_mut(&mut self, action: &'static str) -> Result<&mut WorkflowState, EngineError> {
        let state = self.state_mut()?;
        if !state.is_running() {
            return Err(EngineError::InvalidStatus {
                action,
                status: state.status,
            });
        }
        Ok(state)
    }

    /// The current step of a running state, checked against `requested`.
    fn checked_current_step(
        &mut self,
        action: &'static str,
        requested: Option<&str>,
    ) -> Result<StepDefinition, EngineError> {
        let state = self.running_state_mut(action)?;
        let status = state.status;
        let current = state.current_step.clone();
        if let Some(requested) = requested {
            if current.as_deref() != Some(requested) {
                return Err(EngineError::StepMismatch {
                    requested: requested.to_string(),
                    current,
                });
            }
        }
        let id = current.ok_or(EngineError::InvalidStatus { action, status })?;
        self.graph
            .step(&id)
            .cloned()
            .ok_or(EngineError::UnknownStep(id))
    }

    fn record_gate(
        &mut self,
        step: &StepDefinition,
        passed: bool,
        routed_to: Option<String>,
        detail: Value,
    ) -> Result<(), EngineError> {
        let record = GateRecord {
            passed,
            routed_to,
            detail,
        };
        let value =
            serde_json::to_value(record).map_err(|e| StateError::Serialization(e.to_string()))?;
        self.state_mut()?
            .set_var(variables::gate_key(&step.id), value);
        Ok(())
    }

    /// Move to `next`, or complete the run when there is none.
    fn route_to(&mut self, next: Option<String>) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        match next {
            Some(step_id) => {
                tracing::debug!(workflow_id = %state.workflow_id, next = %step_id, "advanced");
                state.current_step = Some(step_id);
            }
            None => {
                state.current_step = None;
                state.status = WorkflowStatus::Completed;
                tracing::info!(workflow_id = %state.workflow_id, "workflow completed");
            }
        }
    }

    fn fail_run(&mut self, kind: FailureKind, step: Option<String>, message: String) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        tracing::warn!(
            workflow_id = %state.workflow_id,
            step_id = ?step,
            kind = ?kind,
            error = %message,
            "workflow failed"
        );
        let record = FailureRecord {
            kind,
            step,
            message: message.clone(),
        };
        if let Ok(value) = serde_json::to_value(record) {
            state.set_var(ENGINE_FAILURE, value);
        }
        state.status = WorkflowStatus::Failed;
        state.current_step = None;
        state.error = Some(message);
    }

    async fn persist(&self) -> Result<&WorkflowState, EngineError> {
        let state = self.state.as_ref().ok_or(EngineError::NotStarted)?;
        let meta = self.store.save(state).await?;
        tracing::debug!(
            workflow_id = %state.workflow_id,
            storage_key = %meta.storage_key,
            status = %state.status,
            "state persisted"
        );
        Ok(state)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::memory::MemoryStateStore;
    use crate::testing::{
        FailingAgent, ScriptedAgent, SlowAgent, TestHasher, gated_step, linear_definition, step,
    };
    use crate::workflow::agent::ProducedArtifact;
    use crate::workflow::gate::{GateDecision, GateError};
    use cadence_types::workflow::ArtifactStatus;

    fn store() -> Arc<MemoryStateStore> {
        Arc::new(MemoryStateStore::new(Arc::new(TestHasher)))
    }

    fn review_loop_definition() -> WorkflowDefinition {
        let mut review = gated_step("review", "next", "implement");
        review.next = Some("test".into());
        WorkflowDefinition {
            name: "story".into(),
            description: None,
            version: Some("1.0.0".into()),
            steps: vec![step("implement", Some("review")), review, step("test", None)],
        }
    }

    fn agents_for(ids: &[&str]) -> AgentRegistry {
        ids.iter().fold(AgentRegistry::new(), |registry, id| {
            registry.with(ScriptedAgent::always(
                &format!("agent-{id}"),
                StepOutcome::default(),
            ))
        })
    }

    #[tokio::test]
    async fn test_start_persists_and_records_definition() {
        let store = store();
        let mut engine = WorkflowEngine::new(store.clone(), review_loop_definition()).unwrap();
        let state = engine
            .start(
                StartRequest::default()
                    .with_source("flows/story.yaml")
                    .with_input("story", json!("3.2")),
            )
            .await
            .unwrap()
            .clone();

        assert!(state.workflow_id.starts_with("story-"));
        assert_eq!(state.current_step.as_deref(), Some("implement"));
        assert_eq!(state.status, WorkflowStatus::Running);
        assert_eq!(state.workflow_name(), Some("story"));
        assert_eq!(state.var(WORKFLOW_VERSION), Some(&json!("1.0.0")));
        assert_eq!(state.definition_source(), Some("flows/story.yaml"));
        assert_eq!(state.inputs().get("story"), Some(&&json!("3.2")));
        assert_eq!(store.save_count(&state.workflow_id), 1);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let mut engine = WorkflowEngine::new(store(), linear_definition(&["a"])).unwrap();
        engine.start(StartRequest::default()).await.unwrap();
        assert!(matches!(
            engine.start(StartRequest::default()).await,
            Err(EngineError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_advance_follows_next_and_completes() {
        let store = store();
        let mut engine = WorkflowEngine::new(store.clone(), linear_definition(&["a", "b"])).unwrap();
        engine.start(StartRequest::default()).await.unwrap();

        let state = engine.advance(Some("a"), StepOutcome::default()).await.unwrap();
        assert_eq!(state.current_step.as_deref(), Some("b"));

        let state = engine.advance(None, StepOutcome::default()).await.unwrap().clone();
        assert_eq!(state.status, WorkflowStatus::Completed);
        assert!(state.current_step.is_none());
        assert_eq!(state.completed_steps, vec!["a".to_string(), "b".to_string()]);
        // start + two advances, never batched
        assert_eq!(store.save_count(&state.workflow_id), 3);
    }

    #[tokio::test]
    async fn test_advance_wrong_step_is_rejected() {
        let mut engine = WorkflowEngine::new(store(), linear_definition(&["a", "b"])).unwrap();
        engine.start(StartRequest::default()).await.unwrap();
        assert!(matches!(
            engine.advance(Some("b"), StepOutcome::default()).await,
            Err(EngineError::StepMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_advance_before_start() {
        let mut engine = WorkflowEngine::new(store(), linear_definition(&["a"])).unwrap();
        assert!(matches!(
            engine.advance(None, StepOutcome::default()).await,
            Err(EngineError::NotStarted)
        ));
        assert!(engine.current_step().is_none());
        assert!(!engine.can_proceed());
    }

    #[tokio::test]
    async fn test_outputs_and_artifacts_are_merged() {
        let mut engine = WorkflowEngine::new(store(), linear_definition(&["a", "b"])).unwrap();
        engine.start(StartRequest::default()).await.unwrap();
        let outcome = StepOutcome::default()
            .with_output("files", json!(["src/lib.rs"]))
            .with_artifact("code", ProducedArtifact::ready("src/lib.rs"));
        let state = engine.advance(Some("a"), outcome).await.unwrap();

        assert_eq!(state.step_outputs("a"), Some(&json!({ "files": ["src/lib.rs"] })));
        let artifact = &state.artifacts["code"];
        assert_eq!(artifact.created_by, "a");
        assert_eq!(artifact.status, ArtifactStatus::Ready);
    }

    #[tokio::test]
    async fn test_gate_pass_overrides_next() {
        let mut check = gated_step("check", "pass", "fail");
        check.next = Some("fail".into());
        let def = WorkflowDefinition {
            name: "gated".into(),
            description: None,
            version: None,
            steps: vec![check, step("pass", None), step("fail", None)],
        };
        let mut engine = WorkflowEngine::new(store(), def).unwrap();
        engine.start(StartRequest::default()).await.unwrap();

        let state = engine
            .advance(Some("check"), StepOutcome::default().with_gate(true))
            .await
            .unwrap();
        assert_eq!(state.current_step.as_deref(), Some("pass"));
        let record = state.gate_record("check").unwrap();
        assert!(record.passed);
        assert_eq!(record.routed_to.as_deref(), Some("pass"));
    }

    #[tokio::test]
    async fn test_gate_condition_routes_on_fail() {
        let mut engine = WorkflowEngine::new(store(), review_loop_definition()).unwrap();
        engine.start(StartRequest::default()).await.unwrap();
        engine.advance(Some("implement"), StepOutcome::default()).await.unwrap();

        let state = engine
            .advance(
                Some("review"),
                StepOutcome::default().with_output("approved", json!(false)),
            )
            .await
            .unwrap();
        assert_eq!(state.current_step.as_deref(), Some("implement"));
        assert!(!state.gate_record("review").unwrap().passed);
        // Loopback does not duplicate completed steps.
        assert_eq!(state.completed_steps, vec!["implement".to_string(), "review".to_string()]);
    }

    #[tokio::test]
    async fn test_gate_retry_and_next_keywords() {
        let mut review = gated_step("review", "next", "retry");
        review.next = Some("done".into());
        let def = WorkflowDefinition {
            name: "retrying".into(),
            description: None,
            version: None,
            steps: vec![review, step("done", None)],
        };
        let mut engine = WorkflowEngine::new(store(), def).unwrap();
        engine.start(StartRequest::default()).await.unwrap();

        let state = engine
            .advance(None, StepOutcome::default().with_gate(false))
            .await
            .unwrap();
        assert_eq!(state.current_step.as_deref(), Some("review"));
        let state = engine
            .advance(None, StepOutcome::default().with_gate(true))
            .await
            .unwrap();
        assert_eq!(state.current_step.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn test_bad_gate_condition_fails_run() {
        let mut check = gated_step("check", "next", "retry");
        check.gate.as_mut().unwrap().condition = "outputs.x >".into();
        let def = WorkflowDefinition {
            name: "broken-gate".into(),
            description: None,
            version: None,
            steps: vec![check],
        };
        let mut engine = WorkflowEngine::new(store(), def).unwrap();
        engine.start(StartRequest::default()).await.unwrap();
        let state = engine.advance(None, StepOutcome::default()).await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Failed);
        assert_eq!(state.failure().unwrap().kind, FailureKind::GateError);
    }

    #[tokio::test]
    async fn test_skip_ignores_gate() {
        let mut review = gated_step("review", "retry", "retry");
        review.next = Some("done".into());
        let def = WorkflowDefinition {
            name: "skippable".into(),
            description: None,
            version: None,
            steps: vec![review, step("done", None)],
        };
        let mut engine = WorkflowEngine::new(store(), def).unwrap();
        engine.start(StartRequest::default()).await.unwrap();

        let state = engine.skip("review").await.unwrap();
        assert_eq!(state.current_step.as_deref(), Some("done"));
        assert!(state.skipped_steps.contains("review"));
        assert!(state.completed_steps.is_empty());
        assert!(state.gate_record("review").is_none());
    }

    #[tokio::test]
    async fn test_can_proceed_checks_required_artifacts() {
        let mut b = step("b", None);
        b.requires = vec!["code".into()];
        let def = WorkflowDefinition {
            name: "requires".into(),
            description: None,
            version: None,
            steps: vec![step("a", Some("b")), b],
        };
        let mut engine = WorkflowEngine::new(store(), def.clone()).unwrap();
        engine.start(StartRequest::default()).await.unwrap();
        engine.advance(None, StepOutcome::default()).await.unwrap();
        assert_eq!(engine.current_step().unwrap().id, "b");
        assert!(!engine.can_proceed());

        let mut engine = WorkflowEngine::new(store(), def).unwrap();
        engine.start(StartRequest::default()).await.unwrap();
        engine
            .advance(
                None,
                StepOutcome::default().with_artifact("code", ProducedArtifact::ready("lib.rs")),
            )
            .await
            .unwrap();
        assert!(engine.can_proceed());
    }

    #[tokio::test]
    async fn test_execute_fails_before_dispatching_step_with_missing_artifacts() {
        let mut b = step("b", None);
        b.requires = vec!["code".into(), "plan".into()];
        let def = WorkflowDefinition {
            name: "requires".into(),
            description: None,
            version: None,
            steps: vec![step("a", Some("b")), b],
        };
        let agent_b = Arc::new(ScriptedAgent::always("agent-b", StepOutcome::default()));
        let agents = AgentRegistry::new()
            .with(ScriptedAgent::always(
                "agent-a",
                StepOutcome::default().with_artifact("plan", ProducedArtifact::ready("plan.md")),
            ))
            .with(agent_b.clone());

        let store = store();
        let mut engine = WorkflowEngine::new(store.clone(), def).unwrap();
        engine.start(StartRequest::default()).await.unwrap();
        let state = engine.execute(&agents).await.unwrap();

        assert_eq!(state.status, WorkflowStatus::Failed);
        assert_eq!(state.completed_steps, vec!["a"]);
        let failure = state.failure().unwrap();
        assert_eq!(failure.kind, FailureKind::MissingArtifacts);
        assert_eq!(failure.step.as_deref(), Some("b"));
        assert!(state.error.as_deref().unwrap().contains("missing artifacts: code"));
        assert!(agent_b.calls().is_empty());

        let (saved, _) = store.load(None).await.unwrap();
        assert_eq!(saved.status, WorkflowStatus::Failed);
    }

    #[tokio::test]
    async fn test_pause_and_unpause() {
        let mut engine = WorkflowEngine::new(store(), linear_definition(&["a", "b"])).unwrap();
        engine.start(StartRequest::default()).await.unwrap();

        let state = engine.pause().await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Paused);
        assert_eq!(state.current_step.as_deref(), Some("a"));
        assert!(!engine.can_proceed());
        assert!(matches!(
            engine.advance(None, StepOutcome::default()).await,
            Err(EngineError::InvalidStatus { action: "advance", .. })
        ));

        let state = engine.unpause().await.unwrap();
        assert!(state.is_running());
        assert!(engine.unpause().await.is_err());
    }

    #[tokio::test]
    async fn test_fail_records_reason() {
        let mut engine = WorkflowEngine::new(store(), linear_definition(&["a", "b"])).unwrap();
        engine.start(StartRequest::default()).await.unwrap();
        let state = engine.fail("operator abort").await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Failed);
        assert!(state.current_step.is_none());
        assert_eq!(state.error.as_deref(), Some("operator abort"));
        let failure = state.failure().unwrap();
        assert_eq!(failure.kind, FailureKind::Aborted);
        assert_eq!(failure.step.as_deref(), Some("a"));
        assert!(engine.fail("again").await.is_err());
    }

    #[tokio::test]
    async fn test_execute_runs_to_completion() {
        let store = store();
        let mut engine =
            WorkflowEngine::new(store.clone(), linear_definition(&["a", "b", "c"])).unwrap();
        engine.start(StartRequest::default()).await.unwrap();
        let state = engine.execute(&agents_for(&["a", "b", "c"])).await.unwrap().clone();
        assert_eq!(state.status, WorkflowStatus::Completed);
        assert_eq!(state.completed_steps.len(), 3);
        assert_eq!(store.save_count(&state.workflow_id), 4);
    }

    #[tokio::test]
    async fn test_execute_agent_failure_halts_without_retry() {
        let agents = AgentRegistry::new()
            .with(ScriptedAgent::always("agent-a", StepOutcome::default()))
            .with(FailingAgent::new("agent-b", "compiler exploded"));
        let mut engine = WorkflowEngine::new(store(), linear_definition(&["a", "b", "c"])).unwrap();
        engine.start(StartRequest::default()).await.unwrap();
        let state = engine.execute(&agents).await.unwrap();

        assert_eq!(state.status, WorkflowStatus::Failed);
        assert_eq!(state.completed_steps, vec!["a".to_string()]);
        let failure = state.failure().unwrap();
        assert_eq!(failure.kind, FailureKind::Agent);
        assert_eq!(failure.step.as_deref(), Some("b"));
        assert!(state.error.as_deref().unwrap().contains("compiler exploded"));
    }

    #[tokio::test]
    async fn test_execute_unknown_agent_fails_fast() {
        let mut engine = WorkflowEngine::new(store(), linear_definition(&["a"])).unwrap();
        engine.start(StartRequest::default()).await.unwrap();
        let state = engine.execute(&AgentRegistry::new()).await.unwrap();
        assert_eq!(state.failure().unwrap().kind, FailureKind::UnknownAgent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_times_out_agent() {
        let mut slow = step("a", None);
        slow.timeout_secs = Some(1);
        let def = WorkflowDefinition {
            name: "slow".into(),
            description: None,
            version: None,
            steps: vec![slow],
        };
        let agents = AgentRegistry::new().with(SlowAgent::new("agent-a", Duration::from_secs(60)));
        let mut engine = WorkflowEngine::new(store(), def).unwrap();
        engine.start(StartRequest::default()).await.unwrap();
        let state = engine.execute(&agents).await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Failed);
        assert_eq!(state.failure().unwrap().kind, FailureKind::Timeout);
    }

    #[tokio::test]
    async fn test_execute_stops_at_max_steps() {
        // review always fails its gate and loops back to itself
        let def = WorkflowDefinition {
            name: "cycle".into(),
            description: None,
            version: None,
            steps: vec![gated_step("review", "next", "retry")],
        };
        let agents = AgentRegistry::new().with(ScriptedAgent::always(
            "agent-review",
            StepOutcome::default().with_gate(false),
        ));
        let store = store();
        let mut engine = WorkflowEngine::new(store.clone(), def)
            .unwrap()
            .with_config(EngineConfig {
                max_steps: 5,
                ..EngineConfig::default()
            });
        engine.start(StartRequest::default()).await.unwrap();
        let state = engine.execute(&agents).await.unwrap().clone();

        assert_eq!(state.status, WorkflowStatus::Failed);
        assert_eq!(state.failure().unwrap().kind, FailureKind::MaxStepsExceeded);
        assert!(state.error.as_deref().unwrap().contains("max steps exceeded"));
        // start + 5 advances + final failure
        assert_eq!(store.save_count(&state.workflow_id), 7);
    }

    #[tokio::test]
    async fn test_execute_with_exact_budget_completes() {
        let mut engine = WorkflowEngine::new(store(), linear_definition(&["a", "b", "c"]))
            .unwrap()
            .with_config(EngineConfig {
                max_steps: 3,
                ..EngineConfig::default()
            });
        engine.start(StartRequest::default()).await.unwrap();
        let state = engine.execute(&agents_for(&["a", "b", "c"])).await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Completed);
    }

    struct HaltingDecider;

    impl GateDecider for HaltingDecider {
        async fn decide(&self, _input: &GateInput<'_>) -> Result<GateDecision, GateError> {
            Ok(GateDecision::halt(json!({ "score": 3.0 }), "score below threshold"))
        }
    }

    #[tokio::test]
    async fn test_halting_decider_fails_run_with_record() {
        let agents = agents_for(&["implement", "review", "test"]);
        let mut engine = WorkflowEngine::new(store(), review_loop_definition()).unwrap();
        engine.start(StartRequest::default()).await.unwrap();
        let state = engine.execute_with(&agents, &HaltingDecider).await.unwrap();

        assert_eq!(state.status, WorkflowStatus::Failed);
        assert_eq!(state.failure().unwrap().kind, FailureKind::GateHalted);
        let record = state.gate_record("review").unwrap();
        assert!(!record.passed);
        assert!(record.routed_to.is_none());
        assert_eq!(record.detail["score"], 3.0);
    }

    #[tokio::test]
    async fn test_resume_continues_where_left_off() {
        let store = store();
        let mut engine =
            WorkflowEngine::new(store.clone(), linear_definition(&["a", "b", "c"])).unwrap();
        engine.start(StartRequest::default()).await.unwrap();
        engine.advance(None, StepOutcome::default()).await.unwrap();
        let before = engine.into_state().unwrap();

        let mut resumed =
            WorkflowEngine::new(store.clone(), linear_definition(&["a", "b", "c"])).unwrap();
        let state = resumed.resume(None).await.unwrap();
        assert_eq!(state.workflow_id, before.workflow_id);
        assert_eq!(state.current_step, before.current_step);
        assert_eq!(state.completed_steps, before.completed_steps);
        assert_eq!(state.status, before.status);

        let state = resumed.execute(&agents_for(&["b", "c"])).await.unwrap();
        assert_eq!(state.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn test_resume_rejects_other_definition() {
        let store = store();
        let mut engine = WorkflowEngine::new(store.clone(), linear_definition(&["a", "b"])).unwrap();
        engine.start(StartRequest::default()).await.unwrap();

        let mut other = WorkflowEngine::new(store.clone(), review_loop_definition()).unwrap();
        assert!(matches!(
            other.resume(None).await,
            Err(EngineError::DefinitionMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_resume_rejects_unknown_current_step() {
        let store = store();
        let mut engine = WorkflowEngine::new(store.clone(), linear_definition(&["a", "b"])).unwrap();
        engine.start(StartRequest::default()).await.unwrap();
        engine.advance(None, StepOutcome::default()).await.unwrap();

        // same name, but step "b" no longer exists
        let mut shrunk = WorkflowEngine::new(store.clone(), linear_definition(&["a"])).unwrap();
        assert!(matches!(
            shrunk.resume(None).await,
            Err(EngineError::UnknownStep(step)) if step == "b"
        ));
    }
}
