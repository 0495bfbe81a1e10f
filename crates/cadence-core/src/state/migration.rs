//! Versioned migration of persisted state documents.
//!
//! A document whose `schema_version` differs from the current version is
//! walked along registered `(from, to)` steps until it reaches the target.
//! Steps only backfill fields; they never drop or rewrite existing data. A
//! version with no registered step is a hard error so old-shaped data never
//! reaches new-shaped logic.

use cadence_types::error::StateError;
use cadence_types::state::{FIELD_SCHEMA_VERSION, SCHEMA_VERSION};
use serde_json::{Map, Value, json};

/// Version assumed for documents written before the envelope carried one.
pub const LEGACY_SCHEMA_VERSION: &str = "1.0";

type MigrationFn = fn(&mut Map<String, Value>);

/// One `(from, to)` migration step.
pub struct Migration {
    pub from: &'static str,
    pub to: &'static str,
    apply: MigrationFn,
}

impl Migration {
    pub fn new(from: &'static str, to: &'static str, apply: MigrationFn) -> Self {
        Self { from, to, apply }
    }
}

/// Applies registered migrations up to a target schema version.
pub struct Migrator {
    target: String,
    migrations: Vec<Migration>,
}

impl Migrator {
    /// An empty migrator targeting `target`.
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            migrations: Vec::new(),
        }
    }

    /// The migrator for the current schema with every known step registered.
    pub fn standard() -> Self {
        Self::new(SCHEMA_VERSION).with(Migration::new("1.0", "2.0", backfill_v2))
    }

    pub fn with(mut self, migration: Migration) -> Self {
        self.migrations.push(migration);
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Schema version declared by `doc`, or [`LEGACY_SCHEMA_VERSION`] if absent.
    pub fn version_of(doc: &Value) -> String {
        doc.get(FIELD_SCHEMA_VERSION)
            .and_then(Value::as_str)
            .unwrap_or(LEGACY_SCHEMA_VERSION)
            .to_string()
    }

    /// Migrate `doc` in place. Returns `true` if any step ran.
    pub fn migrate(&self, doc: &mut Value) -> Result<bool, StateError> {
        let original = Self::version_of(doc);
        if original == self.target {
            return Ok(false);
        }

        let map = doc
            .as_object_mut()
            .ok_or_else(|| StateError::Corrupt("state document is not an object".to_string()))?;

        let mut version = original.clone();
        let mut applied = 0usize;
        while version != self.target {
            // Every step is used at most once, so a longer walk means a cycle.
            let step = self
                .migrations
                .iter()
                .find(|m| m.from == version)
                .filter(|_| applied < self.migrations.len())
                .ok_or_else(|| StateError::Migration {
                    from: original.clone(),
                    to: self.target.clone(),
                })?;

            (step.apply)(map);
            map.insert(FIELD_SCHEMA_VERSION.to_string(), json!(step.to));
            tracing::debug!(from = step.from, to = step.to, "applied state migration");
            version = step.to.to_string();
            applied += 1;
        }

        tracing::info!(from = %original, to = %self.target, "migrated state document");
        Ok(true)
    }
}

impl Default for Migrator {
    fn default() -> Self {
        Self::standard()
    }
}

fn backfill(map: &mut Map<String, Value>, field: &str, default: Value) {
    map.entry(field.to_string()).or_insert(default);
}

/// 1.0 -> 2.0: artifacts, skipped steps, variables and error were introduced.
fn backfill_v2(map: &mut Map<String, Value>) {
    backfill(map, "artifacts", json!({}));
    backfill(map, "skipped_steps", json!([]));
    backfill(map, "variables", json!({}));
    backfill(map, "error", Value::Null);
}
