//! Resource dependency graph.

use std::collections::{BTreeMap, BTreeSet};

use crate::address::ResourceAddress;
use crate::error::{PlanError, Result, TerraceError};

/// Directed graph of resources to the resources they depend on.
///
/// Ordered collections keep every traversal deterministic.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    edges: BTreeMap<ResourceAddress, BTreeSet<ResourceAddress>>,
}

impl DependencyGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node with no dependencies.
    pub fn add_node(&mut self, address: ResourceAddress) {
        self.edges.entry(address).or_default();
    }

    /// Records that `node` depends on `dependency`. Both become nodes.
    pub fn add_dependency(&mut self, node: ResourceAddress, dependency: ResourceAddress) {
        self.add_node(dependency.clone());
        self.edges.entry(node).or_default().insert(dependency);
    }

    /// Orders nodes so every node follows all of its dependencies.
    ///
    /// Ties are broken by address, so the order is deterministic.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::GraphCycle`] naming the members of a cycle.
    pub fn topological_order(&self) -> Result<Vec<ResourceAddress>> {
        let mut remaining: BTreeMap<&ResourceAddress, usize> =
            self.edges.iter().map(|(node, deps)| (node, deps.len())).collect();
        let mut dependents: BTreeMap<&ResourceAddress, Vec<&ResourceAddress>> = BTreeMap::new();
        for (node, deps) in &self.edges {
            for dep in deps {
                dependents.entry(dep).or_default().push(node);
            }
        }

        let mut ready: BTreeSet<&ResourceAddress> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(node, _)| *node)
            .collect();
        let mut order = Vec::with_capacity(self.edges.len());

        while let Some(node) = ready.pop_first() {
            remaining.remove(node);
            order.push(node.clone());
            for dependent in dependents.get(node).into_iter().flatten() {
                if let Some(count) = remaining.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(*dependent);
                    }
                }
            }
        }

        if remaining.is_empty() {
            Ok(order)
        } else {
            let stuck: BTreeSet<&ResourceAddress> = remaining.into_keys().collect();
            Err(TerraceError::Plan(PlanError::GraphCycle {
                members: self.find_cycle(&stuck),
            }))
        }
    }

    /// Finds one cycle among `stuck` nodes, returned as a closed path.
    fn find_cycle(&self, stuck: &BTreeSet<&ResourceAddress>) -> Vec<String> {
        let Some(&start) = stuck.first() else {
            return Vec::new();
        };

        // Every stuck node has a stuck dependency, so walking them must revisit a node
        let mut path: Vec<&ResourceAddress> = vec![start];
        let mut current = start;
        loop {
            let Some(next) = self
                .edges
                .get(current)
                .and_then(|deps| deps.iter().find(|d| stuck.contains(d)))
            else {
                return path.iter().map(ToString::to_string).collect();
            };

            if let Some(pos) = path.iter().position(|n| *n == next) {
                let mut members: Vec<String> = path[pos..].iter().map(ToString::to_string).collect();
                members.push(next.to_string());
                return members;
            }
            path.push(next);
            current = next;
        }
    }
}
