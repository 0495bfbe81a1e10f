//! Infrastructure layer for Cadence.
//!
//! Contains implementations of the port traits defined in `cadence-core`:
//! the file-backed state store and epic repository, SHA-256 content hashing,
//! and the `config.toml` loader.

pub mod config;
pub mod crypto;
pub mod filesystem;
