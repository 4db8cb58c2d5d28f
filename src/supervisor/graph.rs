//! Dependency graph validation and ordering
//!
//! The service graph must be acyclic; this is checked on every registration
//! so no process is ever spawned for an invalid graph.

use std::collections::HashMap;

use crate::common::{Error, Result};

/// A node is a service name plus the names it depends on.
pub type Node = (String, Vec<String>);

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Returns the name of a service participating in a cycle, if any.
///
/// Edges to names not present in `nodes` are ignored; dangling references
/// are a separate configuration error caught before this runs.
pub fn find_cycle(nodes: &[Node]) -> Option<String> {
    let index: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, (name, _))| (name.as_str(), i))
        .collect();
    let mut marks = vec![Mark::Unvisited; nodes.len()];

    fn visit(
        i: usize,
        nodes: &[Node],
        index: &HashMap<&str, usize>,
        marks: &mut [Mark],
    ) -> Option<String> {
        match marks[i] {
            Mark::Done => return None,
            Mark::InProgress => return Some(nodes[i].0.clone()),
            Mark::Unvisited => {}
        }
        marks[i] = Mark::InProgress;
        for dep in &nodes[i].1 {
            if let Some(&j) = index.get(dep.as_str()) {
                if let Some(found) = visit(j, nodes, index, marks) {
                    return Some(found);
                }
            }
        }
        marks[i] = Mark::Done;
        None
    }

    for i in 0..nodes.len() {
        if let Some(found) = visit(i, nodes, &index, &mut marks) {
            return Some(found);
        }
    }
    None
}

/// Compute a topological ordering of the graph.
///
/// Services with no mutual ordering keep their registration order, so the
/// result is deterministic for a given input.
pub fn topo_order(nodes: &[Node]) -> Result<Vec<String>> {
    if let Some(service) = find_cycle(nodes) {
        return Err(Error::DependencyCycle { service });
    }

    let index: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, (name, _))| (name.as_str(), i))
        .collect();
    let mut indegree = vec![0usize; nodes.len()];
    for (i, (_, deps)) in nodes.iter().enumerate() {
        indegree[i] = deps
            .iter()
            .filter(|d| index.contains_key(d.as_str()))
            .count();
    }

    let mut order = Vec::with_capacity(nodes.len());
    let mut emitted = vec![false; nodes.len()];
    while order.len() < nodes.len() {
        let mut progressed = false;
        for i in 0..nodes.len() {
            if !emitted[i] && indegree[i] == 0 {
                emitted[i] = true;
                progressed = true;
                order.push(nodes[i].0.clone());
                for (j, (_, deps)) in nodes.iter().enumerate() {
                    if !emitted[j] && deps.contains(&nodes[i].0) {
                        indegree[j] -= 1;
                    }
                }
            }
        }
        if !progressed {
            return Err(Error::Internal("topological sort stalled".into()));
        }
    }
    Ok(order)
}
