//! JEXL evaluator for gate conditions.
//!
//! Wraps `jexl_eval::Evaluator` with a small set of transforms and builds the
//! `{ step, outputs, variables }` context a gate condition is evaluated in.
//!
//! Step outputs are always passed as context values, never interpolated into
//! the expression string.

use std::collections::BTreeMap;

use cadence_types::workflow::StepDefinition;
use serde_json::{Value, json};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// ConditionEvaluator
// ---------------------------------------------------------------------------

/// JEXL evaluator with the gate transforms registered.
pub struct ConditionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("contains", |args: &[Value]| {
                let found = match (args.first(), args.get(1)) {
                    (Some(Value::String(s)), Some(Value::String(needle))) => s.contains(needle.as_str()),
                    (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
                    (Some(Value::Object(map)), Some(Value::String(key))) => map.contains_key(key),
                    _ => false,
                };
                Ok(json!(found))
            })
            .with_transform("not", |args: &[Value]| {
                Ok(json!(!truthy(args.first().unwrap_or(&Value::Null))))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            })
            .with_transform("min", |args: &[Value]| {
                // Smallest number among an array or an object's values.
                let numbers: Vec<f64> = match args.first() {
                    Some(Value::Array(a)) => a.iter().filter_map(Value::as_f64).collect(),
                    Some(Value::Object(o)) => o.values().filter_map(Value::as_f64).collect(),
                    _ => Vec::new(),
                };
                Ok(numbers
                    .into_iter()
                    .reduce(f64::min)
                    .map_or(Value::Null, |m| json!(m)))
            });

        Self { evaluator }
    }

    /// Evaluate `expression` and coerce the result with JavaScript-like
    /// truthiness.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        Ok(truthy(&self.evaluate_value(expression, context)?))
    }

    /// Evaluate `expression` and return the raw JSON value.
    pub fn evaluate_value(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }
        self.evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Gate context
// ---------------------------------------------------------------------------

/// Build the context object a gate condition evaluates against:
///
/// ```json
/// {
///   "step": { "id": "...", "agent": "...", "action": "..." },
///   "outputs": { ...outputs of the gated step... },
///   "variables": { ...the full variable map... }
/// }
/// ```
pub fn gate_context(
    step: &StepDefinition,
    outputs: Option<&Value>,
    variables: &BTreeMap<String, Value>,
) -> Value {
    json!({
        "step": {
            "id": step.id,
            "agent": step.agent_ref,
            "action": step.action,
        },
        "outputs": outputs.cloned().unwrap_or_else(|| json!({})),
        "variables": variables,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::step;

    fn evaluator() -> ConditionEvaluator {
        ConditionEvaluator::new()
    }

    #[test]
    fn test_output_comparison() {
        let ctx = gate_context(
            &step("review", None),
            Some(&json!({ "approved": true, "score": 8.5 })),
            &BTreeMap::new(),
        );
        let eval = evaluator();
        assert!(eval.evaluate_bool("outputs.approved == true", &ctx).unwrap());
        assert!(eval.evaluate_bool("outputs.score >= 7.0", &ctx).unwrap());
        assert!(!eval.evaluate_bool("outputs.score >= 9.0", &ctx).unwrap());
    }

    #[test]
    fn test_step_fields_in_context() {
        let ctx = gate_context(&step("review", None), None, &BTreeMap::new());
        assert!(evaluator().evaluate_bool("step.id == 'review'", &ctx).unwrap());
        assert!(evaluator().evaluate_bool("step.agent == 'agent-review'", &ctx).unwrap());
    }

    #[test]
    fn test_dotted_variable_keys_use_brackets() {
        let mut vars = BTreeMap::new();
        vars.insert("input.story".to_string(), json!("3.2"));
        let ctx = gate_context(&step("a", None), None, &vars);
        assert!(
            evaluator()
                .evaluate_bool("variables['input.story'] == '3.2'", &ctx)
                .unwrap()
        );
    }

    #[test]
    fn test_missing_outputs_are_falsy() {
        let ctx = gate_context(&step("a", None), None, &BTreeMap::new());
        assert!(!evaluator().evaluate_bool("outputs.approved", &ctx).unwrap());
    }

    #[test]
    fn test_transforms() {
        let ctx = json!({
            "outputs": {
                "verdict": "APPROVED",
                "issues": ["lint"],
                "scores": { "quality": 8.0, "coverage": 6.5 }
            }
        });
        let eval = evaluator();
        assert!(eval.evaluate_bool("outputs.verdict|lower == 'approved'", &ctx).unwrap());
        assert!(eval.evaluate_bool("outputs.issues|length == 1", &ctx).unwrap());
        assert!(eval.evaluate_bool("outputs.issues|contains('lint')", &ctx).unwrap());
        assert!(eval.evaluate_bool("outputs.scores|min < 7.0", &ctx).unwrap());
        assert!(eval.evaluate_bool("(outputs.missing)|not", &ctx).unwrap());
    }

    #[test]
    fn test_invalid_context_not_object() {
        assert!(matches!(
            evaluator().evaluate_bool("true", &json!("text")),
            Err(ExpressionError::InvalidContext(_))
        ));
    }

    #[test]
    fn test_syntax_error_is_eval_failure() {
        let ctx = json!({});
        assert!(matches!(
            evaluator().evaluate_bool("outputs.score >=", &ctx),
            Err(ExpressionError::EvalFailed(_))
        ));
    }
}
