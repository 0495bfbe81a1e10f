//! SHA-256 implementation of the `ContentHasher` port.

use cadence_core::service::hash::ContentHasher;
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 (64 lowercase characters).
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256ContentHasher;

impl Sha256ContentHasher {
    pub fn new() -> Self {
        Self
    }
}

impl ContentHasher for Sha256ContentHasher {
    fn compute_hash(&self, content: &str) -> String {
        format!("{:x}", Sha256::digest(content.as_bytes()))
    }
}
