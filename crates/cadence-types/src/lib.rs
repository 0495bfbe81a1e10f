//! Shared domain types for Cadence.
//!
//! This crate contains the types used across every layer of the workflow
//! engine: step definitions, the persisted workflow state and its metadata
//! envelope, epic items, aggregated agent results, configuration, and the
//! error types shared by the store trait and its implementations.
//!
//! Zero infrastructure dependencies -- only serde, chrono, thiserror, schemars.

pub mod aggregate;
pub mod config;
pub mod epic;
pub mod error;
pub mod state;
pub mod variables;
pub mod workflow;
