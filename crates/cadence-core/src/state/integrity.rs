//! Storage-agnostic integrity for persisted state documents.
//!
//! A persisted document is the JSON form of a [`WorkflowState`] plus the
//! envelope fields `schema_version`, `saved_at` and `checksum`. The checksum
//! covers the *stable projection* of the document: every field except the
//! volatile envelope fields, with set-valued fields sorted, serialized as
//! canonical JSON (object keys sorted, no insignificant whitespace).

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};

use cadence_types::error::StateError;
use cadence_types::state::{FIELD_CHECKSUM, FIELD_SAVED_AT, FIELD_SCHEMA_VERSION, SCHEMA_VERSION};
use cadence_types::workflow::{WorkflowState, WorkflowStatus};

use super::migration::Migrator;
use crate::service::hash::ContentHasher;

/// Envelope fields excluded from the checksum.
const VOLATILE_FIELDS: &[&str] = &[FIELD_CHECKSUM, FIELD_SAVED_AT];

/// Fields with set semantics; sorted before hashing.
const SET_FIELDS: &[&str] = &["skipped_steps"];

// ---------------------------------------------------------------------------
// Projection and canonical form
// ---------------------------------------------------------------------------

/// Copy of `doc` with volatile fields removed and set fields sorted.
pub fn stable_projection(doc: &Value) -> Value {
    let mut projected = doc.clone();
    if let Value::Object(map) = &mut projected {
        for field in VOLATILE_FIELDS {
            map.remove(*field);
        }
        for field in SET_FIELDS {
            if let Some(Value::Array(items)) = map.get_mut(*field) {
                items.sort_by_cached_key(canonical_json);
                items.dedup();
            }
        }
    }
    projected
}

/// Serialize `value` with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Checksum of the stable projection of `doc`.
pub fn compute_checksum(hasher: &dyn ContentHasher, doc: &Value) -> String {
    hasher.compute_hash(&canonical_json(&stable_projection(doc)))
}

// ---------------------------------------------------------------------------
// Seal / verify
// ---------------------------------------------------------------------------

/// A state document ready to be written.
#[derive(Debug, Clone)]
pub struct SealedDocument {
    pub doc: Value,
    pub checksum: String,
    pub saved_at: DateTime<Utc>,
}

/// Serialize `state` into a versioned, checksummed document.
pub fn seal(
    hasher: &dyn ContentHasher,
    state: &WorkflowState,
    saved_at: DateTime<Utc>,
) -> Result<SealedDocument, StateError> {
    let mut doc =
        serde_json::to_value(state).map_err(|e| StateError::Serialization(e.to_string()))?;
    let map = as_object_mut(&mut doc)?;
    map.insert(FIELD_SCHEMA_VERSION.to_string(), json!(SCHEMA_VERSION));
    map.insert(FIELD_SAVED_AT.to_string(), json!(saved_at));

    let checksum = compute_checksum(hasher, &doc);
    as_object_mut(&mut doc)?.insert(FIELD_CHECKSUM.to_string(), json!(checksum));

    Ok(SealedDocument {
        doc,
        checksum,
        saved_at,
    })
}

/// Recompute the checksum of `doc` and compare it with the stored one.
///
/// Returns the stored checksum, or `None` when the document carries none
/// (only legal for legacy schema versions).
pub fn verify_checksum(
    hasher: &dyn ContentHasher,
    doc: &Value,
) -> Result<Option<String>, StateError> {
    let Some(stored) = doc.get(FIELD_CHECKSUM) else {
        if Migrator::version_of(doc) == SCHEMA_VERSION {
            return Err(StateError::Validation(format!(
                "missing {FIELD_CHECKSUM} on schema {SCHEMA_VERSION} document"
            )));
        }
        return Ok(None);
    };
    let expected = stored
        .as_str()
        .ok_or_else(|| StateError::Validation(format!("{FIELD_CHECKSUM} is not a string")))?;

    let actual = compute_checksum(hasher, doc);
    if actual != expected {
        return Err(StateError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(Some(actual))
}

/// Check the fields every loadable document must carry.
pub fn validate_required_fields(doc: &Value) -> Result<(), StateError> {
    let map = doc
        .as_object()
        .ok_or_else(|| StateError::Corrupt("state document is not an object".to_string()))?;

    match map.get("workflow_id").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => {}
        _ => return Err(missing("workflow_id")),
    }

    let started_at = map
        .get("started_at")
        .and_then(Value::as_str)
        .ok_or_else(|| missing("started_at"))?;
    DateTime::parse_from_rfc3339(started_at)
        .map_err(|e| StateError::Validation(format!("started_at is not a timestamp: {e}")))?;

    let status_str = map
        .get("status")
        .and_then(Value::as_str)
        .ok_or_else(|| missing("status"))?;
    let status = WorkflowStatus::parse(status_str)
        .ok_or_else(|| StateError::Validation(format!("unknown status '{status_str}'")))?;

    let current_step = map.get("current_step").and_then(Value::as_str);
    if status.is_active() != current_step.is_some() {
        return Err(StateError::Validation(format!(
            "status '{status}' is inconsistent with current_step {current_step:?}"
        )));
    }

    let completed = map
        .get("completed_steps")
        .and_then(Value::as_array)
        .ok_or_else(|| missing("completed_steps"))?;
    let mut seen = std::collections::HashSet::new();
    for step in completed {
        let step = step
            .as_str()
            .ok_or_else(|| StateError::Validation("completed_steps holds a non-string".into()))?;
        if !seen.insert(step) {
            return Err(StateError::Validation(format!(
                "step '{step}' completed twice"
            )));
        }
    }

    Ok(())
}

fn missing(field: &str) -> StateError {
    StateError::Validation(format!("missing or invalid required field '{field}'"))
}

fn as_object_mut(doc: &mut Value) -> Result<&mut Map<String, Value>, StateError> {
    doc.as_object_mut()
        .ok_or_else(|| StateError::Serialization("state did not serialize to an object".into()))
}

// ---------------------------------------------------------------------------
// Open
// ---------------------------------------------------------------------------

/// A document that passed verification, migration and validation.
#[derive(Debug, Clone)]
pub struct OpenedDocument {
    pub state: WorkflowState,
    /// Schema version as read, before migration.
    pub stored_version: String,
    /// Checksum of the document in its current-schema form.
    pub checksum: String,
    pub saved_at: Option<DateTime<Utc>>,
    pub migrated: bool,
}

/// Parse raw bytes of a state document.
pub fn parse_document(bytes: &[u8]) -> Result<Value, StateError> {
    serde_json::from_slice(bytes).map_err(|e| StateError::Corrupt(e.to_string()))
}

/// Verify, migrate and validate a raw document, in that order.
///
/// The checksum is verified against the document as stored, so a legacy
/// document is checked under the projection it was sealed with.
pub fn open_document(
    hasher: &dyn ContentHasher,
    migrator: &Migrator,
    mut doc: Value,
) -> Result<OpenedDocument, StateError> {
    let stored_version = Migrator::version_of(&doc);
    let stored_checksum = verify_checksum(hasher, &doc)?;
    let migrated = migrator.migrate(&mut doc)?;
    validate_required_fields(&doc)?;

    let saved_at = doc
        .get(FIELD_SAVED_AT)
        .and_then(|v| serde_json::from_value::<DateTime<Utc>>(v.clone()).ok());
    let checksum = match stored_checksum {
        Some(checksum) if !migrated => checksum,
        _ => compute_checksum(hasher, &doc),
    };
    let state: WorkflowState =
        serde_json::from_value(doc).map_err(|e| StateError::Validation(e.to_string()))?;

    Ok(OpenedDocument {
        state,
        stored_version,
        checksum,
        saved_at,
        migrated,
    })
}
