//! Quality gate for epic items.
//!
//! A `QualityGateEvaluator` scores one iteration of an item. The
//! `QualityGateDecider` adapts it to the engine's `GateDecider` seam: a
//! passing verdict routes the review gate onward, anything else *halts* the
//! sub-run so the epic runner's iteration budget owns the loopback.

use std::future::Future;
use std::sync::Mutex;

use cadence_types::config::EpicConfig;
use cadence_types::epic::{GateVerdict, Item};
use cadence_types::workflow::WorkflowState;
use serde_json::{Value, json};
use thiserror::Error;

use crate::workflow::gate::{GateDecider, GateDecision, GateError, GateInput};

#[derive(Debug, Error)]
pub enum QualityError {
    #[error("quality evaluation failed: {0}")]
    Failed(String),

    #[error("malformed review outputs: {0}")]
    Malformed(String),
}

/// Scores one iteration of an item.
pub trait QualityGateEvaluator: Send + Sync {
    fn evaluate(
        &self,
        item: &Item,
        state: &WorkflowState,
    ) -> impl Future<Output = Result<GateVerdict, QualityError>> + Send;
}

impl<T: QualityGateEvaluator> QualityGateEvaluator for std::sync::Arc<T> {
    fn evaluate(
        &self,
        item: &Item,
        state: &WorkflowState,
    ) -> impl Future<Output = Result<GateVerdict, QualityError>> + Send {
        (**self).evaluate(item, state)
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Threshold selection, including the stricter bar for critical items.
#[derive(Debug, Clone)]
pub struct QualityPolicy {
    pub threshold: f64,
    pub critical_threshold: f64,
    keywords: Vec<String>,
}

impl QualityPolicy {
    pub fn new(threshold: f64, critical_threshold: f64, keywords: &[String]) -> Self {
        Self {
            threshold,
            critical_threshold,
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
        }
    }

    pub fn from_config(config: &EpicConfig) -> Self {
        Self::new(
            config.quality_threshold,
            config.critical_threshold,
            &config.critical_keywords,
        )
    }

    /// Whether the item's title or description mentions a critical keyword.
    pub fn is_critical(&self, item: &Item) -> bool {
        let text = match &item.description {
            Some(description) => format!("{} {}", item.title, description),
            None => item.title.clone(),
        }
        .to_lowercase();
        self.keywords.iter().any(|k| text.contains(k.as_str()))
    }

    pub fn threshold_for(&self, item: &Item) -> f64 {
        if self.is_critical(item) {
            self.critical_threshold
        } else {
            self.threshold
        }
    }

    /// A verdict passes when the evaluator approved it and no score falls
    /// below `threshold`.
    pub fn accepts(verdict: &GateVerdict, threshold: f64) -> bool {
        verdict.passed && verdict.min_score().is_none_or(|min| min >= threshold)
    }
}

impl Default for QualityPolicy {
    fn default() -> Self {
        Self::from_config(&EpicConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Decider
// ---------------------------------------------------------------------------

/// Gate decider for one iteration of one item.
pub struct QualityGateDecider<'a, Q> {
    evaluator: &'a Q,
    item: &'a Item,
    threshold: f64,
    last: Mutex<Option<GateVerdict>>,
}

impl<'a, Q: QualityGateEvaluator> QualityGateDecider<'a, Q> {
    pub fn new(evaluator: &'a Q, item: &'a Item, threshold: f64) -> Self {
        Self {
            evaluator,
            item,
            threshold,
            last: Mutex::new(None),
        }
    }

    /// Verdict of the most recent gate evaluation.
    pub fn last_verdict(&self) -> Option<GateVerdict> {
        self.last.lock().ok().and_then(|guard| guard.clone())
    }
}

impl<Q: QualityGateEvaluator> GateDecider for QualityGateDecider<'_, Q> {
    async fn decide(&self, input: &GateInput<'_>) -> Result<GateDecision, GateError> {
        let verdict = self
            .evaluator
            .evaluate(self.item, input.state)
            .await
            .map_err(|e| GateError::Evaluator(e.to_string()))?;

        let accepted = QualityPolicy::accepts(&verdict, self.threshold);
        let detail = json!({
            "source": "quality",
            "passed": verdict.passed,
            "scores": verdict.scores,
            "threshold": self.threshold,
        });
        tracing::info!(
            item_id = %self.item.id,
            step_id = %input.step.id,
            accepted,
            min_score = ?verdict.min_score(),
            threshold = self.threshold,
            "quality gate evaluated"
        );

        let reason = match verdict.min_score() {
            _ if accepted => None,
            Some(min) if min < self.threshold => Some(format!(
                "quality gate failed: score {min:.1} below threshold {:.1}",
                self.threshold
            )),
            _ => Some("quality gate failed: rejected by evaluator".to_string()),
        };

        if let Ok(mut last) = self.last.lock() {
            *last = Some(verdict);
        }

        Ok(match reason {
            None => GateDecision::pass(detail),
            Some(reason) => GateDecision::halt(detail, reason),
        })
    }
}

// ---------------------------------------------------------------------------
// Built-in evaluator
// ---------------------------------------------------------------------------

/// Reads the verdict the review agent reported in its outputs:
/// `outputs.<step>.approved` (bool) and `outputs.<step>.scores` (object of
/// numbers).
#[derive(Debug, Clone)]
pub struct ReviewOutputEvaluator {
    step_id: String,
}

impl ReviewOutputEvaluator {
    pub fn new(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
        }
    }

    fn verdict(&self, state: &WorkflowState) -> Result<GateVerdict, QualityError> {
        let Some(outputs) = state.step_outputs(&self.step_id) else {
            return Ok(GateVerdict::default());
        };
        let passed = outputs
            .get("approved")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let mut verdict = GateVerdict {
            passed,
            ..GateVerdict::default()
        };
        if let Some(scores) = outputs.get("scores") {
            let scores = scores.as_object().ok_or_else(|| {
                QualityError::Malformed(format!("outputs.{}.scores is not an object", self.step_id))
            })?;
            for (name, score) in scores {
                let score = score.as_f64().ok_or_else(|| {
                    QualityError::Malformed(format!("score '{name}' is not a number"))
                })?;
                verdict.scores.insert(name.clone(), score);
            }
        }
        Ok(verdict)
    }
}

impl QualityGateEvaluator for ReviewOutputEvaluator {
    async fn evaluate(&self, _item: &Item, state: &WorkflowState) -> Result<GateVerdict, QualityError> {
        self.verdict(state)
    }
}
