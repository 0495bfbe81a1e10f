//! Gate decisions.
//!
//! When the engine advances past a gated step it asks a `GateDecider` whether
//! the gate passed. The default `ExpressionGate` honours an explicit decision
//! from the step outcome and otherwise evaluates the gate's JEXL condition.
//! Other deciders (the epic quality gate) may also halt the run outright.

use std::future::Future;

use cadence_types::workflow::{Gate, StepDefinition, WorkflowState};
use serde_json::{Value, json};
use thiserror::Error;

use super::expression::{ConditionEvaluator, ExpressionError, gate_context};

/// Input handed to a decider. The step's outputs are already merged into
/// `state` under `outputs.<step>`.
pub struct GateInput<'a> {
    pub state: &'a WorkflowState,
    pub step: &'a StepDefinition,
    pub gate: &'a Gate,
    /// Decision reported by the agent, if any.
    pub explicit: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GateDecision {
    pub passed: bool,
    /// Recorded in the gate record (`gate.<step>`).
    pub detail: Value,
    /// When set, the run fails with this reason instead of routing.
    pub halt_reason: Option<String>,
}

impl GateDecision {
    pub fn pass(detail: Value) -> Self {
        Self {
            passed: true,
            detail,
            halt_reason: None,
        }
    }

    pub fn fail(detail: Value) -> Self {
        Self {
            passed: false,
            detail,
            halt_reason: None,
        }
    }

    pub fn halt(detail: Value, reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            detail,
            halt_reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error("gate evaluator failed: {0}")]
    Evaluator(String),
}

pub trait GateDecider: Send + Sync {
    fn decide(
        &self,
        input: &GateInput<'_>,
    ) -> impl Future<Output = Result<GateDecision, GateError>> + Send;
}

/// Default decider: explicit decision first, JEXL condition otherwise.
#[derive(Default)]
pub struct ExpressionGate {
    evaluator: ConditionEvaluator,
}

impl ExpressionGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn evaluate(&self, input: &GateInput<'_>) -> Result<GateDecision, GateError> {
        if let Some(passed) = input.explicit {
            let detail = json!({ "source": "explicit" });
            return Ok(if passed {
                GateDecision::pass(detail)
            } else {
                GateDecision::fail(detail)
            });
        }

        let context = gate_context(
            input.step,
            input.state.step_outputs(&input.step.id),
            &input.state.variables,
        );
        let passed = self
            .evaluator
            .evaluate_bool(&input.gate.condition, &context)?;
        let detail = json!({ "source": "condition", "condition": input.gate.condition });
        Ok(if passed {
            GateDecision::pass(detail)
        } else {
            GateDecision::fail(detail)
        })
    }
}

impl GateDecider for ExpressionGate {
    async fn decide(&self, input: &GateInput<'_>) -> Result<GateDecision, GateError> {
        self.evaluate(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::gated_step;
    use cadence_types::variables::outputs_key;
    use chrono::Utc;

    fn state_with_outputs(step_id: &str, outputs: Value) -> WorkflowState {
        let mut state = WorkflowState::new("wf".into(), Utc::now(), step_id.into());
        state.set_var(outputs_key(step_id), outputs);
        state
    }

    #[tokio::test]
    async fn test_explicit_decision_wins() {
        let step = gated_step("review", "next", "retry");
        let state = state_with_outputs("review", json!({ "approved": true }));
        let input = GateInput {
            state: &state,
            step: &step,
            gate: step.gate.as_ref().unwrap(),
            explicit: Some(false),
        };
        let decision = ExpressionGate::new().decide(&input).await.unwrap();
        assert!(!decision.passed);
        assert_eq!(decision.detail["source"], "explicit");
        assert!(decision.halt_reason.is_none());
    }

    #[tokio::test]
    async fn test_condition_evaluated_against_outputs() {
        let step = gated_step("review", "next", "retry");
        let gate = step.gate.as_ref().unwrap();
        let approved = state_with_outputs("review", json!({ "approved": true }));
        let rejected = state_with_outputs("review", json!({ "approved": false }));

        let decider = ExpressionGate::new();
        let pass = decider
            .decide(&GateInput { state: &approved, step: &step, gate, explicit: None })
            .await
            .unwrap();
        let fail = decider
            .decide(&GateInput { state: &rejected, step: &step, gate, explicit: None })
            .await
            .unwrap();
        assert!(pass.passed);
        assert!(!fail.passed);
        assert_eq!(pass.detail["condition"], gate.condition.as_str());
    }

    #[tokio::test]
    async fn test_bad_condition_is_error() {
        let mut step = gated_step("review", "next", "retry");
        step.gate.as_mut().unwrap().condition = "outputs.approved ==".into();
        let state = state_with_outputs("review", json!({}));
        let input = GateInput {
            state: &state,
            step: &step,
            gate: step.gate.as_ref().unwrap(),
            explicit: None,
        };
        assert!(matches!(
            ExpressionGate::new().decide(&input).await,
            Err(GateError::Expression(_))
        ));
    }
}
