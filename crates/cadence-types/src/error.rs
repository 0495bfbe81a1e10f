use thiserror::Error;

/// Errors from state store operations (used by the trait in cadence-core and
/// its implementations in cadence-infra).
#[derive(Debug, Error)]
pub enum StateError {
    #[error("state not found: {0}")]
    NotFound(String),

    #[error("invalid record id '{0}'")]
    InvalidRecordId(String),

    #[error("state validation failed: {0}")]
    Validation(String),

    #[error("checksum mismatch: expected '{expected}', got '{actual}'")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("corrupt state document: {0}")]
    Corrupt(String),

    #[error("no recoverable state for '{record_id}' ({attempts} snapshots checked)")]
    NoRecoverableState { record_id: String, attempts: usize },

    #[error("no migration path from schema version '{from}' to '{to}'")]
    Migration { from: String, to: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage I/O error: {0}")]
    Io(String),
}

impl StateError {
    /// Whether a load failing with this error should fall back to history.
    ///
    /// Validation, checksum and corruption failures are recoverable, as is a
    /// missing primary file. Migration and plain I/O failures are not.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StateError::Validation(_)
                | StateError::ChecksumMismatch { .. }
                | StateError::Corrupt(_)
                | StateError::NotFound(_)
        )
    }
}

/// Errors from epic repositories (trait in cadence-core, file implementation
/// in cadence-infra).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("epic '{0}' not found")]
    NotFound(String),

    #[error("invalid epic id '{0}'")]
    InvalidId(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("repository I/O error: {0}")]
    Io(String),
}
