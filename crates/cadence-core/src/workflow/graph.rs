//! Step graph: indexed view of a validated definition plus route resolution.
//!
//! Workflows are near-linear chains with gate branch points, so routing is a
//! lookup rather than a schedule. `petgraph` is used only for reachability
//! diagnostics.

use std::collections::HashMap;

use cadence_types::workflow::{ROUTE_NEXT, ROUTE_RETRY, StepDefinition, WorkflowDefinition};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;

use super::definition::{WorkflowError, validate_definition};

/// Validated, indexed workflow definition.
#[derive(Debug, Clone)]
pub struct StepGraph {
    definition: WorkflowDefinition,
    index: HashMap<String, usize>,
}

impl StepGraph {
    /// Validate `definition` and index its steps.
    pub fn new(definition: WorkflowDefinition) -> Result<Self, WorkflowError> {
        validate_definition(&definition)?;
        let index = definition
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();
        let graph = Self { definition, index };

        let unreachable = graph.unreachable_steps();
        if !unreachable.is_empty() {
            tracing::warn!(
                workflow = %graph.definition.name,
                steps = ?unreachable,
                "workflow has steps no route can reach"
            );
        }
        Ok(graph)
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.index.get(id).map(|&i| &self.definition.steps[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Entry step. A validated definition always has one.
    pub fn first_step(&self) -> &StepDefinition {
        &self.definition.steps[0]
    }

    /// Resolve a gate target for `step` to a concrete step id.
    ///
    /// [`ROUTE_NEXT`] follows the step's own `next`, [`ROUTE_RETRY`] stays on
    /// the step. `None` means the workflow completes.
    pub fn resolve_route(&self, step: &StepDefinition, target: &str) -> Option<String> {
        match target {
            ROUTE_NEXT => step.next.clone(),
            ROUTE_RETRY => Some(step.id.clone()),
            id => Some(id.to_string()),
        }
    }

    /// Every step id a route out of `step` can lead to.
    fn successors<'a>(&'a self, step: &'a StepDefinition) -> impl Iterator<Item = &'a str> + 'a {
        let gate_targets = step.gate.iter().flat_map(move |gate| {
            [gate.on_pass.as_str(), gate.on_fail.as_str()]
                .into_iter()
                .filter_map(move |target| match target {
                    ROUTE_NEXT => step.next.as_deref(),
                    ROUTE_RETRY => Some(step.id.as_str()),
                    id => Some(id),
                })
        });
        step.next.as_deref().into_iter().chain(gate_targets)
    }

    /// Steps that cannot be reached from the entry step, in definition order.
    pub fn unreachable_steps(&self) -> Vec<&str> {
        let mut graph = DiGraph::<&str, ()>::new();
        let nodes: Vec<NodeIndex> = self
            .definition
            .steps
            .iter()
            .map(|s| graph.add_node(s.id.as_str()))
            .collect();

        for (i, step) in self.definition.steps.iter().enumerate() {
            for target in self.successors(step) {
                if let Some(&j) = self.index.get(target) {
                    graph.update_edge(nodes[i], nodes[j], ());
                }
            }
        }

        let mut reachable = vec![false; nodes.len()];
        let mut bfs = Bfs::new(&graph, nodes[0]);
        while let Some(node) = bfs.next(&graph) {
            reachable[node.index()] = true;
        }

        self.definition
            .steps
            .iter()
            .zip(reachable)
            .filter(|(_, reached)| !reached)
            .map(|(s, _)| s.id.as_str())
            .collect()
    }
}
