//! Dependency ordering for epic items.
//!
//! Items and their `dependencies` become a `petgraph` directed graph with an
//! edge from each dependency to its dependent. Ordering is Kahn's algorithm
//! rather than `petgraph::algo::toposort` so that a cycle reports every
//! unresolved id, not just one node on it.
//!
//! Ties are broken by input order: among items that become ready together,
//! the one listed first in the epic runs first.

use std::collections::{HashMap, HashSet, VecDeque};

use cadence_types::epic::Item;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("duplicate item id '{0}'")]
    DuplicateItem(String),

    #[error("item '{item}' depends on unknown item '{dependency}'")]
    UnknownDependency { item: String, dependency: String },

    /// Items that could not be ordered, in input order.
    #[error("dependency cycle among items: {}", remaining.join(", "))]
    Cycle { remaining: Vec<String> },
}

/// Order `items` so every item comes after all of its dependencies.
pub fn resolve(items: &[Item]) -> Result<Vec<String>, ResolveError> {
    let (graph, _) = build_graph(items)?;

    let mut in_degree: Vec<usize> = graph
        .node_indices()
        .map(|n| graph.neighbors_directed(n, Direction::Incoming).count())
        .collect();

    let mut queue: VecDeque<NodeIndex> = graph
        .node_indices()
        .filter(|n| in_degree[n.index()] == 0)
        .collect();
    let mut order = Vec::with_capacity(items.len());

    while let Some(node) = queue.pop_front() {
        order.push(graph[node].to_string());

        // petgraph yields neighbours newest-edge first; sort for input order
        let mut dependents: Vec<NodeIndex> = graph
            .neighbors_directed(node, Direction::Outgoing)
            .collect();
        dependents.sort_unstable();
        for dependent in dependents {
            let degree = &mut in_degree[dependent.index()];
            *degree -= 1;
            if *degree == 0 {
                queue.push_back(dependent);
            }
        }
    }

    if order.len() < items.len() {
        let ordered: HashSet<&str> = order.iter().map(String::as_str).collect();
        let remaining = items
            .iter()
            .map(|i| i.id.clone())
            .filter(|id| !ordered.contains(id.as_str()))
            .collect();
        return Err(ResolveError::Cycle { remaining });
    }

    tracing::debug!(items = order.len(), order = ?order, "resolved execution order");
    Ok(order)
}

/// Ids of every item that depends on `item_id`, directly or transitively.
pub fn dependents_of(items: &[Item], item_id: &str) -> Result<Vec<String>, ResolveError> {
    let (graph, index) = build_graph(items)?;
    let Some(&start) = index.get(item_id) else {
        return Ok(Vec::new());
    };

    let mut seen = HashSet::new();
    let mut stack = vec![start];
    while let Some(node) = stack.pop() {
        for dependent in graph.neighbors_directed(node, Direction::Outgoing) {
            if seen.insert(dependent) {
                stack.push(dependent);
            }
        }
    }

    let mut found: Vec<NodeIndex> = seen.into_iter().collect();
    found.sort_unstable();
    Ok(found.into_iter().map(|n| graph[n].to_string()).collect())
}

fn build_graph(items: &[Item]) -> Result<(DiGraph<&str, ()>, HashMap<&str, NodeIndex>), ResolveError> {
    let mut graph = DiGraph::<&str, ()>::with_capacity(items.len(), items.len());
    let mut index = HashMap::with_capacity(items.len());

    for item in items {
        let node = graph.add_node(item.id.as_str());
        if index.insert(item.id.as_str(), node).is_some() {
            return Err(ResolveError::DuplicateItem(item.id.clone()));
        }
    }

    for item in items {
        let to = index[item.id.as_str()];
        let mut seen = HashSet::new();
        for dependency in &item.dependencies {
            // a repeated dependency counts once
            if !seen.insert(dependency.as_str()) {
                continue;
            }
            let from = index.get(dependency.as_str()).ok_or_else(|| {
                ResolveError::UnknownDependency {
                    item: item.id.clone(),
                    dependency: dependency.clone(),
                }
            })?;
            graph.add_edge(*from, to, ());
        }
    }

    Ok((graph, index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_types::epic::ItemStatus;

    fn item(id: &str, deps: &[&str]) -> Item {
        Item {
            id: id.into(),
            title: format!("Story {id}"),
            description: None,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            status: ItemStatus::NotStarted,
        }
    }

    fn position(order: &[String], id: &str) -> usize {
        order.iter().position(|o| o == id).unwrap()
    }

    #[test]
    fn test_independent_items_keep_input_order() {
        let items = vec![item("1.3", &[]), item("1.1", &[]), item("1.2", &[])];
        assert_eq!(resolve(&items).unwrap(), vec!["1.3", "1.1", "1.2"]);
    }

    #[test]
    fn test_dependencies_come_first() {
        let items = vec![
            item("2.4", &["2.2", "2.3"]),
            item("2.3", &["2.1"]),
            item("2.2", &["2.1"]),
            item("2.1", &[]),
        ];
        let order = resolve(&items).unwrap();
        assert_eq!(order.len(), 4);
        for it in &items {
            for dep in &it.dependencies {
                assert!(position(&order, dep) < position(&order, &it.id));
            }
        }
        // 2.3 is listed before 2.2, so it is released first
        assert_eq!(order, vec!["2.1", "2.3", "2.2", "2.4"]);
    }

    #[test]
    fn test_cycle_reports_exactly_the_cycle() {
        let items = vec![
            item("3.1", &[]),
            item("3.2", &["3.1", "3.4"]),
            item("3.3", &["3.2"]),
            item("3.4", &["3.3"]),
        ];
        assert_eq!(
            resolve(&items),
            Err(ResolveError::Cycle {
                remaining: vec!["3.2".into(), "3.3".into(), "3.4".into()]
            })
        );
    }

    #[test]
    fn test_items_downstream_of_cycle_are_unresolved() {
        let items = vec![
            item("4.1", &["4.2"]),
            item("4.2", &["4.1"]),
            item("4.3", &["4.1"]),
            item("4.4", &[]),
        ];
        let Err(ResolveError::Cycle { remaining }) = resolve(&items) else {
            panic!("expected a cycle");
        };
        assert_eq!(remaining, vec!["4.1", "4.2", "4.3"]);
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let items = vec![item("5.1", &["5.1"])];
        assert_eq!(
            resolve(&items),
            Err(ResolveError::Cycle { remaining: vec!["5.1".into()] })
        );
    }

    #[test]
    fn test_unknown_dependency() {
        let items = vec![item("6.1", &["9.9"])];
        assert_eq!(
            resolve(&items),
            Err(ResolveError::UnknownDependency {
                item: "6.1".into(),
                dependency: "9.9".into()
            })
        );
    }

    #[test]
    fn test_duplicate_item() {
        let items = vec![item("7.1", &[]), item("7.1", &[])];
        assert_eq!(resolve(&items), Err(ResolveError::DuplicateItem("7.1".into())));
    }

    #[test]
    fn test_repeated_dependency_counts_once() {
        let items = vec![item("8.1", &[]), item("8.2", &["8.1", "8.1"])];
        assert_eq!(resolve(&items).unwrap(), vec!["8.1", "8.2"]);
    }

    #[test]
    fn test_empty_epic() {
        assert!(resolve(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_transitive_dependents() {
        let items = vec![
            item("9.1", &[]),
            item("9.2", &["9.1"]),
            item("9.3", &["9.2"]),
            item("9.4", &[]),
        ];
        assert_eq!(dependents_of(&items, "9.1").unwrap(), vec!["9.2", "9.3"]);
        assert!(dependents_of(&items, "9.4").unwrap().is_empty());
        assert!(dependents_of(&items, "missing").unwrap().is_empty());
    }
}
