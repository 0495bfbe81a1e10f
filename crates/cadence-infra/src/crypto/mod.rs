//! Cryptographic operations for Cadence.
//!
//! - `hash`: SHA-256 content hashing for state document checksums

pub mod hash;
