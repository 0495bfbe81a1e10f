//! Business logic and port traits for Cadence.
//!
//! This crate defines the "ports" (store, hasher, clock, agent, gate and
//! quality collaborator traits) that the infrastructure layer and embedding
//! applications implement. It depends only on `cadence-types` -- never on
//! `cadence-infra` or any filesystem code.

pub mod aggregate;
pub mod epic;
pub mod service;
pub mod state;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;
