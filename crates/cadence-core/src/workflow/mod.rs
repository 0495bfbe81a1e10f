//! Workflow definitions and the step state machine.
//!
//! - `definition` -- YAML/JSON parsing and structural validation
//! - `graph` -- indexed step lookup, route resolution, reachability
//! - `expression` -- JEXL evaluation of gate conditions
//! - `gate` -- pluggable gate deciders
//! - `agent` -- the agent collaborator port and registry
//! - `engine` -- `WorkflowEngine`, the single writer of a run's state

pub mod agent;
pub mod definition;
pub mod engine;
pub mod expression;
pub mod gate;
pub mod graph;
