//! Epic document parsing and validation.
//!
//! An epic document lists items with composite `epic.story` ids:
//!
//! ```yaml
//! id: "3"
//! title: Accounts
//! items:
//!   - id: "3.1"
//!     title: Sign-up form
//!   - id: "3.2"
//!     title: Login
//!     dependencies: ["3.1"]
//! ```
//!
//! Validation is structural only. Dependency cycles are left to
//! [`resolve`](super::resolver::resolve), which reports the unresolved ids.

use std::collections::HashSet;
use std::path::Path;

use cadence_types::epic::Epic;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EpicDocumentError {
    #[error("parse error: {0}")]
    ParseError(String),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Parse a YAML string into a validated `Epic`.
pub fn parse_epic_yaml(yaml: &str) -> Result<Epic, EpicDocumentError> {
    let epic: Epic =
        serde_yaml_ng::from_str(yaml).map_err(|e| EpicDocumentError::ParseError(e.to_string()))?;
    validate_epic(&epic)?;
    Ok(epic)
}

/// Parse a JSON string into a validated `Epic`.
pub fn parse_epic_json(json: &str) -> Result<Epic, EpicDocumentError> {
    let epic: Epic =
        serde_json::from_str(json).map_err(|e| EpicDocumentError::ParseError(e.to_string()))?;
    validate_epic(&epic)?;
    Ok(epic)
}

/// Load an epic from disk. `.json` files are parsed as JSON, anything else
/// as YAML.
pub fn load_epic_file(path: &Path) -> Result<Epic, EpicDocumentError> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_epic_json(&content),
        _ => parse_epic_yaml(&content),
    }
}

/// Validate structural constraints on an `Epic`.
///
/// Checks:
/// - Epic id is non-empty and contains only alphanumerics, `-` and `_`
/// - Item ids are unique and shaped `<epic id>.<story>`
/// - Every dependency names an item of the same epic
pub fn validate_epic(epic: &Epic) -> Result<(), EpicDocumentError> {
    if epic.id.is_empty() || !epic.id.chars().all(is_id_char) {
        return Err(EpicDocumentError::ValidationError(format!(
            "epic id '{}' must be non-empty and contain only alphanumerics, '-' or '_'",
            epic.id
        )));
    }

    let mut ids = HashSet::new();
    for item in &epic.items {
        let story = item
            .id
            .strip_prefix(epic.id.as_str())
            .and_then(|rest| rest.strip_prefix('.'));
        let well_formed = story.is_some_and(|s| !s.is_empty() && s.chars().all(is_id_char));
        if !well_formed {
            return Err(EpicDocumentError::ValidationError(format!(
                "item id '{}' is not of the form '{}.<story>'",
                item.id, epic.id
            )));
        }
        if item.title.trim().is_empty() {
            return Err(EpicDocumentError::ValidationError(format!(
                "item '{}' has an empty title",
                item.id
            )));
        }
        if !ids.insert(item.id.as_str()) {
            return Err(EpicDocumentError::ValidationError(format!(
                "duplicate item id: '{}'",
                item.id
            )));
        }
    }

    for item in &epic.items {
        if let Some(missing) = item.dependencies.iter().find(|d| !ids.contains(d.as_str())) {
            return Err(EpicDocumentError::ValidationError(format!(
                "item '{}' depends on unknown item '{missing}'",
                item.id
            )));
        }
    }

    Ok(())
}

fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}
