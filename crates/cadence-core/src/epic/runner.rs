//! The epic execution loop.
//!
//! `EpicRunner::run` resolves the item order once, then runs each item
//! through the story template with a `WorkflowEngine`, one item at a time:
//!
//! 1. Items already `done` are skipped (re-runs resume where they stopped).
//! 2. Items with a dependency that is not `done` are marked `blocked`.
//! 3. Otherwise the item runs up to `max_iterations` sub-runs. A failing
//!    quality gate halts the sub-run; the improver agent is invoked on the
//!    failing artifact and its outputs are passed to the next iteration as
//!    `input.feedback`. Any other sub-run failure fails the item at once.
//!
//! The `EpicState` is saved after every item status change and every
//! iteration, and one `ItemSummary` is appended per finished item.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use cadence_types::config::{EngineConfig, EpicConfig};
use cadence_types::epic::{
    CompletionReport, Epic, EpicState, Item, ItemProgress, ItemStatus, ItemSummary,
};
use cadence_types::error::RepositoryError;
use cadence_types::variables::{EPIC_ID, EPIC_ITERATION, FailureKind, ITEM_CRITICAL, ITEM_ID, ITEM_TITLE};
use cadence_types::workflow::{StepDefinition, WorkflowDefinition, WorkflowState, WorkflowStatus};
use serde_json::{Value, json};
use thiserror::Error;

use super::quality::{QualityGateDecider, QualityGateEvaluator, QualityPolicy};
use super::report::{build_report, render_handoff};
use super::repository::EpicRepository;
use super::resolver::{ResolveError, resolve};
use super::template::{CODE_ARTIFACT, STORY_WORKFLOW, story_template};
use crate::service::clock::{Clock, SystemClock};
use crate::state::StateStore;
use crate::workflow::agent::{AgentRegistry, AgentRequest};
use crate::workflow::engine::{EngineError, StartRequest, WorkflowEngine};

#[derive(Debug, Error)]
pub enum EpicError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("epic repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("execution order names unknown item '{0}'")]
    UnknownItem(String),
}

/// How one item attempt ended.
enum ItemOutcome {
    Done,
    Failed(String),
}

/// Drives an epic through per-item story sub-runs.
pub struct EpicRunner<S: StateStore, R: EpicRepository, Q: QualityGateEvaluator> {
    store: Arc<S>,
    repository: Arc<R>,
    agents: AgentRegistry,
    evaluator: Q,
    config: EpicConfig,
    policy: QualityPolicy,
    engine_config: EngineConfig,
    template: WorkflowDefinition,
    clock: Arc<dyn Clock>,
}

impl<S, R, Q> EpicRunner<S, R, Q>
where
    S: StateStore,
    R: EpicRepository,
    Q: QualityGateEvaluator,
{
    pub fn new(store: Arc<S>, repository: Arc<R>, agents: AgentRegistry, evaluator: Q) -> Self {
        let config = EpicConfig::default();
        Self {
            store,
            repository,
            agents,
            evaluator,
            policy: QualityPolicy::from_config(&config),
            config,
            engine_config: EngineConfig::default(),
            template: story_template(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_config(mut self, config: EpicConfig) -> Self {
        self.policy = QualityPolicy::from_config(&config);
        self.config = config;
        self
    }

    pub fn with_engine_config(mut self, config: EngineConfig) -> Self {
        self.engine_config = config;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the story template. It must contain a gated step for the
    /// quality gate to be consulted.
    pub fn with_template(mut self, template: WorkflowDefinition) -> Self {
        self.template = template;
        self
    }

    // -----------------------------------------------------------------------
    // Run
    // -----------------------------------------------------------------------

    pub async fn run(&self, epic: &Epic) -> Result<CompletionReport, EpicError> {
        let order = resolve(&epic.items)?;
        let mut state = self.prepare_state(epic, order).await?;
        self.save(&mut state).await?;

        tracing::info!(
            epic_id = %epic.id,
            items = epic.items.len(),
            order = ?state.execution_order,
            "epic run started"
        );

        let items: HashMap<&str, &Item> = epic.items.iter().map(|i| (i.id.as_str(), i)).collect();
        for item_id in state.execution_order.clone() {
            let item = *items
                .get(item_id.as_str())
                .ok_or_else(|| EpicError::UnknownItem(item_id.clone()))?;

            if state.status_of(&item.id) == ItemStatus::Done {
                tracing::debug!(item_id = %item.id, "item already done, skipping");
                continue;
            }

            let blocker = item
                .dependencies
                .iter()
                .find(|d| state.status_of(d) != ItemStatus::Done)
                .map(|d| (d.clone(), state.status_of(d)));
            if let Some((dependency, status)) = blocker {
                tracing::warn!(item_id = %item.id, dependency = %dependency, %status, "item blocked");
                let progress = progress_mut(&mut state, &item.id);
                progress.status = ItemStatus::Blocked;
                progress.error = Some(format!("blocked by dependency '{dependency}' ({status})"));
                self.save(&mut state).await?;
                self.record_summary(epic, item, &state).await?;
                continue;
            }

            self.run_item(epic, item, &mut state).await?;
        }

        state.current_item = None;
        self.save(&mut state).await?;

        let report = build_report(epic, Some(&state), &state.execution_order);
        let handoff = render_handoff(epic, &state, &report);
        if let Err(e) = self.repository.write_handoff(&epic.id, &handoff).await {
            tracing::warn!(epic_id = %epic.id, error = %e, "failed to write handoff document");
        }

        tracing::info!(
            epic_id = %epic.id,
            done = report.count(ItemStatus::Done),
            failed = report.count(ItemStatus::Failed),
            blocked = report.count(ItemStatus::Blocked),
            completion = report.completion_percentage,
            "epic run finished"
        );
        Ok(report)
    }

    /// Load or create the epic state and reset everything not yet done.
    async fn prepare_state(&self, epic: &Epic, order: Vec<String>) -> Result<EpicState, EpicError> {
        let now = self.clock.now();
        let mut state = match self.repository.load_state(&epic.id).await? {
            Some(state) => {
                tracing::info!(epic_id = %epic.id, started_at = %state.started_at, "resuming epic");
                state
            }
            None => EpicState {
                epic_id: epic.id.clone(),
                title: epic.title.clone(),
                started_at: now,
                updated_at: now,
                execution_order: Vec::new(),
                current_item: None,
                items: BTreeMap::new(),
            },
        };

        let ids: HashSet<&str> = epic.items.iter().map(|i| i.id.as_str()).collect();
        state.items.retain(|id, _| ids.contains(id.as_str()));
        state.title = epic.title.clone();
        state.execution_order = order;
        state.current_item = None;

        for item in &epic.items {
            let progress = progress_mut(&mut state, &item.id);
            if item.status == ItemStatus::Done {
                progress.status = ItemStatus::Done;
            }
            if progress.status != ItemStatus::Done {
                progress.status = ItemStatus::NotStarted;
                progress.iterations = 0;
                progress.error = None;
            }
        }
        Ok(state)
    }

    async fn run_item(&self, epic: &Epic, item: &Item, state: &mut EpicState) -> Result<(), EpicError> {
        let critical = self.policy.is_critical(item);
        let threshold = self.policy.threshold_for(item);
        let max_iterations = self.config.max_iterations.max(1);

        progress_mut(state, &item.id).status = ItemStatus::InProgress;
        state.current_item = Some(item.id.clone());
        self.save(state).await?;
        tracing::info!(item_id = %item.id, critical, threshold, "item started");

        let mut feedback = None;
        let outcome = loop {
            let iteration = {
                let progress = progress_mut(state, &item.id);
                progress.iterations += 1;
                progress.iterations
            };

            let decider = QualityGateDecider::new(&self.evaluator, item, threshold);
            let run = self
                .run_iteration(epic, item, iteration, critical, feedback.take(), &decider)
                .await?;

            let progress = progress_mut(state, &item.id);
            progress.workflow_ids.push(run.workflow_id.clone());
            if let Some(verdict) = decider.last_verdict() {
                progress.last_scores = verdict.scores;
            }
            self.save(state).await?;

            if run.status == WorkflowStatus::Completed {
                break ItemOutcome::Done;
            }

            let message = run
                .error
                .clone()
                .unwrap_or_else(|| format!("sub-run ended in status {}", run.status));
            let gate_halted = run
                .failure()
                .is_some_and(|f| f.kind == FailureKind::GateHalted);
            if !gate_halted {
                break ItemOutcome::Failed(message);
            }
            if iteration >= max_iterations {
                break ItemOutcome::Failed(format!(
                    "quality gate failed after {iteration} iterations: {message}"
                ));
            }

            tracing::warn!(item_id = %item.id, iteration, reason = %message, "quality gate failed, improving");
            match self.improve(&run).await {
                Ok(notes) => feedback = notes,
                Err(e) => break ItemOutcome::Failed(format!("improver failed: {e}")),
            }
        };

        let progress = progress_mut(state, &item.id);
        match outcome {
            ItemOutcome::Done => {
                progress.status = ItemStatus::Done;
                progress.error = None;
                tracing::info!(item_id = %item.id, iterations = progress.iterations, "item done");
            }
            ItemOutcome::Failed(error) => {
                tracing::warn!(item_id = %item.id, iterations = progress.iterations, error = %error, "item failed");
                progress.status = ItemStatus::Failed;
                progress.error = Some(error);
            }
        }
        state.current_item = None;
        self.save(state).await?;
        self.record_summary(epic, item, state).await
    }

    /// One sub-run of the story template for `item`.
    async fn run_iteration(
        &self,
        epic: &Epic,
        item: &Item,
        iteration: u32,
        critical: bool,
        feedback: Option<Value>,
        decider: &QualityGateDecider<'_, Q>,
    ) -> Result<WorkflowState, EpicError> {
        let mut engine = WorkflowEngine::new(self.store.clone(), self.template.clone())?
            .with_clock(self.clock.clone())
            .with_config(self.engine_config.clone());

        let mut request = StartRequest {
            id_prefix: Some(format!("{STORY_WORKFLOW}-{}-it{iteration}", item.id)),
            ..StartRequest::default()
        }
        .with_input("story", json!(item.id));
        if let Some(feedback) = feedback {
            request = request.with_input("feedback", feedback);
        }
        request.variables.extend([
            (ITEM_ID.to_string(), json!(item.id)),
            (ITEM_TITLE.to_string(), json!(item.title)),
            (ITEM_CRITICAL.to_string(), json!(critical)),
            (EPIC_ID.to_string(), json!(epic.id)),
            (EPIC_ITERATION.to_string(), json!(iteration)),
        ]);

        engine.start(request).await?;
        engine.execute_with(&self.agents, decider).await?;
        Ok(engine.into_state().ok_or(EngineError::NotStarted)?)
    }

    /// Ask the improver agent to revise the failing artifact. Returns its
    /// outputs, or `None` when no improver is registered.
    async fn improve(&self, run: &WorkflowState) -> Result<Option<Value>, String> {
        let Some(agent) = self.agents.get(&self.config.improver_agent) else {
            tracing::warn!(
                agent = %self.config.improver_agent,
                "no improver registered, retrying without feedback"
            );
            return Ok(None);
        };

        let step = StepDefinition {
            id: "improve".to_string(),
            agent_ref: self.config.improver_agent.clone(),
            action: "improve-artifact".to_string(),
            requires: vec![CODE_ARTIFACT.to_string()],
            creates: vec![CODE_ARTIFACT.to_string()],
            next: None,
            gate: None,
            repeats: true,
            timeout_secs: None,
        };
        let request = AgentRequest {
            workflow_id: run.workflow_id.clone(),
            step,
            variables: run.variables.clone(),
            artifacts: run
                .artifacts
                .iter()
                .filter(|(name, _)| name.as_str() == CODE_ARTIFACT)
                .map(|(name, artifact)| (name.clone(), artifact.clone()))
                .collect(),
        };

        let secs = self.engine_config.step_timeout_secs;
        match tokio::time::timeout(Duration::from_secs(secs), agent.execute(&request)).await {
            Ok(Ok(outcome)) => Ok(Some(Value::Object(outcome.outputs))),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {secs}s")),
        }
    }

    async fn save(&self, state: &mut EpicState) -> Result<(), EpicError> {
        state.updated_at = self.clock.now();
        self.repository.save_state(state).await?;
        tracing::debug!(epic_id = %state.epic_id, current_item = ?state.current_item, "epic state saved");
        Ok(())
    }

    async fn record_summary(&self, epic: &Epic, item: &Item, state: &EpicState) -> Result<(), EpicError> {
        let progress = state.items.get(&item.id).cloned().unwrap_or_default();
        let summary = ItemSummary {
            epic_id: epic.id.clone(),
            item_id: item.id.clone(),
            title: item.title.clone(),
            status: progress.status,
            iterations: progress.iterations,
            scores: progress.last_scores,
            workflow_ids: progress.workflow_ids,
            error: progress.error,
            recorded_at: self.clock.now(),
        };
        self.repository.append_summary(&summary).await?;
        Ok(())
    }
}

fn progress_mut<'s>(state: &'s mut EpicState, item_id: &str) -> &'s mut ItemProgress {
    state.items.entry(item_id.to_string()).or_default()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
