//! Workflow graph: adjacency structure, topological order, cycle detection.

use std::collections::{HashMap, HashSet};

use crate::error::EngineError;
use crate::workflow::schema::WorkflowDef;

/// Parsed adjacency view of a workflow definition.
///
/// The topological order breaks ties by document order, which is also the
/// engine's execution order guarantee.
#[derive(Debug)]
pub struct WorkflowGraph {
    pub order: Vec<String>,
    /// node id → outgoing (target, branch label)
    pub successors: HashMap<String, Vec<(String, Option<bool>)>>,
    /// node id → incoming (source, branch label)
    pub predecessors: HashMap<String, Vec<(String, Option<bool>)>>,
}

impl WorkflowGraph {
    /// Validate and build. Cycles, duplicate ids, and edges referencing
    /// unknown nodes are validation errors detected before any node runs.
    pub fn build(def: &WorkflowDef) -> Result<Self, EngineError> {
        if def.nodes.is_empty() {
            return Err(EngineError::Validation(
                "Workflow has no nodes".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for node in &def.nodes {
            if !ids.insert(node.id.clone()) {
                return Err(EngineError::Validation(format!(
                    "Duplicate node id '{}'",
                    node.id
                )));
            }
        }

        let mut successors: HashMap<String, Vec<(String, Option<bool>)>> = HashMap::new();
        let mut predecessors: HashMap<String, Vec<(String, Option<bool>)>> = HashMap::new();
        let mut indegree: HashMap<&str, usize> = def.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();

        for edge in &def.edges {
            if !ids.contains(&edge.from) {
                return Err(EngineError::Validation(format!(
                    "Edge references unknown node '{}'",
                    edge.from
                )));
            }
            if !ids.contains(&edge.to) {
                return Err(EngineError::Validation(format!(
                    "Edge references unknown node '{}'",
                    edge.to
                )));
            }
            successors
                .entry(edge.from.clone())
                .or_default()
                .push((edge.to.clone(), edge.branch));
            predecessors
                .entry(edge.to.clone())
                .or_default()
                .push((edge.from.clone(), edge.branch));
            *indegree.get_mut(edge.to.as_str()).unwrap_or(&mut 0) += 1;
        }

        // Kahn's algorithm, scanning in document order so ties resolve
        // deterministically.
        let mut order = Vec::with_capacity(def.nodes.len());
        let mut emitted: HashSet<&str> = HashSet::new();
        while order.len() < def.nodes.len() {
            let next = def.nodes.iter().find(|n| {
                !emitted.contains(n.id.as_str()) && indegree.get(n.id.as_str()) == Some(&0)
            });
            let Some(node) = next else {
                return Err(EngineError::Validation(
                    "Workflow graph contains a cycle".to_string(),
                ));
            };
            emitted.insert(node.id.as_str());
            order.push(node.id.clone());
            if let Some(targets) = successors.get(&node.id) {
                for (target, _) in targets {
                    if let Some(d) = indegree.get_mut(target.as_str()) {
                        *d -= 1;
                    }
                }
            }
        }

        Ok(Self {
            order,
            successors,
            predecessors,
        })
    }

    /// All nodes reachable from `start` (excluding `start` itself).
    pub fn descendants(&self, start: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack: Vec<&str> = vec![start];
        while let Some(current) = stack.pop() {
            if let Some(targets) = self.successors.get(current) {
                for (target, _) in targets {
                    if seen.insert(target.clone()) {
                        stack.push(target);
                    }
                }
            }
        }
        seen
    }
}
