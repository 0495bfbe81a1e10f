//! ContentHasher trait for computing integrity checksums.
//!
//! Defined in cadence-core so the integrity code can checksum state documents
//! without coupling to a specific digest. The `Sha256ContentHasher` adapter
//! lives in cadence-infra.

/// Abstraction over content hashing for integrity verification.
///
/// Used by the state integrity layer to checksum the stable projection of a
/// workflow state before it is written and again when it is read back.
pub trait ContentHasher: Send + Sync {
    /// Compute a hex-encoded hash of the given content.
    fn compute_hash(&self, content: &str) -> String;
}
