//! Workflow definition parsing, validation, and file loading.
//!
//! Converts YAML or JSON documents into the canonical `WorkflowDefinition`
//! and validates structural constraints (name format, unique ids, resolvable
//! routing targets, semver version).

use std::collections::HashSet;
use std::path::Path;

use cadence_types::workflow::{WorkflowDefinition, is_reserved_route};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading or checking a definition.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// A route names a step that does not exist.
    #[error("step '{step}' routes to unknown step '{target}'")]
    UnknownTarget { step: String, target: String },

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Parse a JSON string into a validated `WorkflowDefinition`.
pub fn parse_workflow_json(json: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_json::from_str(json).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(def).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

/// Load a definition from disk. `.json` files are parsed as JSON, anything
/// else as YAML.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_workflow_json(&content),
        _ => parse_workflow_yaml(&content),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowDefinition`.
///
/// Checks:
/// - Name is non-empty and contains only alphanumerics, hyphens and underscores
/// - `version`, if set, is valid semver
/// - At least one step exists and step ids are unique
/// - No step id shadows a reserved routing keyword
/// - Every `next`, `gate.on_pass` and `gate.on_fail` names an existing step
///   (or, for gate targets, a reserved keyword)
/// - Timeouts are > 0
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if def.name.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow name must not be empty".to_string(),
        ));
    }
    if !def
        .name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(WorkflowError::ValidationError(format!(
            "workflow name '{}' contains invalid characters (only alphanumeric, '-' and '_' allowed)",
            def.name
        )));
    }

    if let Some(version) = &def.version {
        version.parse::<semver::Version>().map_err(|e| {
            WorkflowError::ValidationError(format!("invalid semver version '{version}': {e}"))
        })?;
    }

    if def.steps.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow must have at least one step".to_string(),
        ));
    }

    let mut seen_ids = HashSet::new();
    for step in &def.steps {
        if step.id.is_empty() {
            return Err(WorkflowError::ValidationError(
                "step id must not be empty".to_string(),
            ));
        }
        if is_reserved_route(&step.id) {
            return Err(WorkflowError::ValidationError(format!(
                "step id '{}' is a reserved routing keyword",
                step.id
            )));
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate step ID: '{}'",
                step.id
            )));
        }
        if step.agent_ref.is_empty() {
            return Err(WorkflowError::ValidationError(format!(
                "step '{}' has no agent",
                step.id
            )));
        }
        if step.timeout_secs == Some(0) {
            return Err(WorkflowError::ValidationError(format!(
                "step '{}' timeout must be > 0",
                step.id
            )));
        }
    }

    for step in &def.steps {
        if let Some(next) = &step.next {
            if !seen_ids.contains(next.as_str()) {
                return Err(WorkflowError::UnknownTarget {
                    step: step.id.clone(),
                    target: next.clone(),
                });
            }
        }
        if let Some(gate) = &step.gate {
            if gate.condition.trim().is_empty() {
                return Err(WorkflowError::ValidationError(format!(
                    "gate on step '{}' has an empty condition",
                    step.id
                )));
            }
            for target in [&gate.on_pass, &gate.on_fail] {
                if !is_reserved_route(target) && !seen_ids.contains(target.as_str()) {
                    return Err(WorkflowError::UnknownTarget {
                        step: step.id.clone(),
                        target: target.clone(),
                    });
                }
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
