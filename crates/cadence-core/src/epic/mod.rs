//! Epic execution: ordering dependent items and driving each through the
//! story template with a bounded quality-gate retry loop.
//!
//! - `definition` -- epic document parsing and validation
//! - `resolver` -- Kahn ordering with cycle reporting
//! - `template` -- the fixed six-stage story workflow
//! - `quality` -- quality gate evaluator port, thresholds, and gate decider
//! - `repository` -- epic state, memory log and handoff persistence port
//! - `report` -- completion report and `HANDOFF.md` rendering
//! - `runner` -- the execution loop

pub mod definition;
pub mod quality;
pub mod report;
pub mod repository;
pub mod resolver;
pub mod runner;
pub mod template;
