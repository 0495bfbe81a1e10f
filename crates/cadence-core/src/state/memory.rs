//! In-process `StateStore`.
//!
//! Documents go through the same seal/open path as the file store, so the
//! engine sees identical integrity behavior. Every save is kept, which makes
//! the store useful for asserting on the sequence of checkpoints.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde_json::Value;

use cadence_types::error::StateError;
use cadence_types::state::{SCHEMA_VERSION, StateFilter, StateMetadata};
use cadence_types::workflow::WorkflowState;

use super::integrity::{self, SealedDocument};
use super::migration::Migrator;
use super::{StateStore, validate_record_id};
use crate::service::clock::{Clock, SystemClock};
use crate::service::hash::ContentHasher;

struct Snapshot {
    doc: Value,
    meta: StateMetadata,
}

/// `StateStore` backed by a `DashMap` of snapshot lists.
pub struct MemoryStateStore {
    hasher: Arc<dyn ContentHasher>,
    clock: Arc<dyn Clock>,
    migrator: Migrator,
    records: DashMap<String, Vec<Snapshot>>,
    last: Mutex<Option<String>>,
}

impl MemoryStateStore {
    pub fn new(hasher: Arc<dyn ContentHasher>) -> Self {
        Self::with_clock(hasher, Arc::new(SystemClock))
    }

    pub fn with_clock(hasher: Arc<dyn ContentHasher>, clock: Arc<dyn Clock>) -> Self {
        Self {
            hasher,
            clock,
            migrator: Migrator::standard(),
            records: DashMap::new(),
            last: Mutex::new(None),
        }
    }

    /// Number of saves recorded for `record_id`.
    pub fn save_count(&self, record_id: &str) -> usize {
        self.records.get(record_id).map_or(0, |r| r.len())
    }

    /// Every saved version of `record_id`, oldest first.
    pub fn history(&self, record_id: &str) -> Vec<WorkflowState> {
        let Some(snapshots) = self.records.get(record_id) else {
            return Vec::new();
        };
        snapshots
            .iter()
            .filter_map(|s| serde_json::from_value(s.doc.clone()).ok())
            .collect()
    }

    /// Replace the newest raw document of `record_id`. Test hook for
    /// simulating corruption of the primary copy.
    pub fn overwrite_latest(&self, record_id: &str, doc: Value) {
        if let Some(mut snapshots) = self.records.get_mut(record_id) {
            if let Some(latest) = snapshots.last_mut() {
                latest.doc = doc;
            }
        }
    }

    fn open(&self, snapshot: &Snapshot) -> Result<(WorkflowState, StateMetadata), StateError> {
        let opened = integrity::open_document(
            self.hasher.as_ref(),
            &self.migrator,
            snapshot.doc.clone(),
        )?;
        let mut meta = snapshot.meta.clone();
        meta.checksum = opened.checksum;
        Ok((opened.state, meta))
    }
}

impl StateStore for MemoryStateStore {
    async fn save(&self, state: &WorkflowState) -> Result<StateMetadata, StateError> {
        validate_record_id(&state.workflow_id)?;
        let SealedDocument {
            doc,
            checksum,
            saved_at,
        } = integrity::seal(self.hasher.as_ref(), state, self.clock.now())?;

        let mut snapshots = self.records.entry(state.workflow_id.clone()).or_default();
        let meta = StateMetadata {
            schema_version: SCHEMA_VERSION.to_string(),
            saved_at,
            checksum,
            record_id: state.workflow_id.clone(),
            storage_key: format!("{}#{}", state.workflow_id, snapshots.len()),
            source_definition_path: state.definition_source().map(String::from),
            compression: false,
        };
        snapshots.push(Snapshot {
            doc,
            meta: meta.clone(),
        });
        drop(snapshots);

        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some(state.workflow_id.clone());
        Ok(meta)
    }

    async fn load(
        &self,
        record_id: Option<&str>,
    ) -> Result<(WorkflowState, StateMetadata), StateError> {
        let record_id = match record_id {
            Some(id) => id.to_string(),
            None => self
                .last
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
                .ok_or_else(|| StateError::NotFound("no state has been saved".to_string()))?,
        };
        validate_record_id(&record_id)?;

        let snapshots = self
            .records
            .get(&record_id)
            .ok_or_else(|| StateError::NotFound(record_id.clone()))?;

        let mut attempts = 0;
        for snapshot in snapshots.iter().rev() {
            attempts += 1;
            match self.open(snapshot) {
                Ok(loaded) => return Ok(loaded),
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(record_id = %record_id, error = %e, "skipping invalid snapshot");
                }
                Err(e) => return Err(e),
            }
        }
        Err(StateError::NoRecoverableState {
            record_id,
            attempts,
        })
    }

    async fn list(&self, filter: &StateFilter) -> Result<Vec<StateMetadata>, StateError> {
        let mut metas: Vec<StateMetadata> = self
            .records
            .iter()
            .filter_map(|entry| entry.value().last().map(|s| s.meta.clone()))
            .filter(|meta| filter.matches(meta))
            .collect();
        metas.sort_by(|a, b| {
            b.saved_at
                .cmp(&a.saved_at)
                .then_with(|| a.record_id.cmp(&b.record_id))
        });
        if let Some(limit) = filter.limit {
            metas.truncate(limit);
        }
        Ok(metas)
    }
}
