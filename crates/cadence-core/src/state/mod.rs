//! Durable workflow state: the store port plus the storage-agnostic integrity
//! and migration logic every implementation shares.
//!
//! - `integrity` -- stable projection, canonical JSON, checksum seal/verify,
//!   required-field validation
//! - `migration` -- versioned, additive document migrations
//! - `memory` -- in-process `StateStore` used by tests and embedders

pub mod integrity;
pub mod memory;
pub mod migration;

use std::future::Future;

use cadence_types::error::StateError;
use cadence_types::state::{StateFilter, StateMetadata};
use cadence_types::workflow::WorkflowState;

/// Storage interface for workflow state records.
///
/// Implementations must checksum every save, keep an immutable history of
/// snapshots, and recover from the newest valid snapshot when the primary
/// copy fails validation. Uses native async fn in traits (no async_trait).
pub trait StateStore: Send + Sync {
    /// Persist `state` under its `workflow_id`. Returns the metadata of the
    /// write, whose `storage_key` is the location of the new primary copy.
    fn save(
        &self,
        state: &WorkflowState,
    ) -> impl Future<Output = Result<StateMetadata, StateError>> + Send;

    /// Load a record. `None` loads the most recently written record.
    fn load(
        &self,
        record_id: Option<&str>,
    ) -> impl Future<Output = Result<(WorkflowState, StateMetadata), StateError>> + Send;

    /// List metadata of stored records, newest first.
    fn list(
        &self,
        filter: &StateFilter,
    ) -> impl Future<Output = Result<Vec<StateMetadata>, StateError>> + Send;
}

/// Check that a record id is safe to use as a storage key.
///
/// Ids may contain ASCII alphanumerics, `-`, `_` and `.`, must not start with
/// a dot, and must not contain `..`.
pub fn validate_record_id(record_id: &str) -> Result<(), StateError> {
    let valid = !record_id.is_empty()
        && record_id.len() <= 200
        && !record_id.starts_with('.')
        && !record_id.contains("..")
        && record_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StateError::InvalidRecordId(record_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_record_id() {
        assert!(validate_record_id("story-flow-0190aa").is_ok());
        assert!(validate_record_id("3.2-it1").is_ok());
        assert!(validate_record_id("").is_err());
        assert!(validate_record_id("../etc").is_err());
        assert!(validate_record_id(".hidden").is_err());
        assert!(validate_record_id("a/b").is_err());
        assert!(validate_record_id("a@b").is_err());
    }
}
