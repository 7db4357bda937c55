//! Dependency Graph Builder
//!
//! Edges are derived per request from requirement metadata and are scoped to
//! the candidate set: a provider outside it is never traversed into.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::contracts::RequirementSource;
use crate::model::{Capability, ModuleId};

/// Which way to follow edges.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Towards dependencies (upstream).
    Providing,
    /// Towards dependents (downstream).
    Requiring,
}

/// Adjacency over a candidate set. Neighbour lists hold candidate indices,
/// de-duplicated and in candidate order.
#[derive(Clone, Debug, Default)]
pub struct DependencyGraph {
    nodes: Vec<ModuleId>,
    index: HashMap<ModuleId, usize>,
    providers: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Build the graph for `candidates`. Pure; unresolvable requirements yield no edge.
    pub fn build(candidates: &[ModuleId], source: &dyn RequirementSource) -> Self {
        let mut graph = Self::with_nodes(candidates);

        let mut by_capability: HashMap<Capability, Vec<usize>> = HashMap::new();
        for (idx, id) in graph.nodes.iter().enumerate() {
            for cap in source.capabilities(id) {
                let providers = by_capability.entry(cap).or_default();
                if !providers.contains(&idx) {
                    providers.push(idx);
                }
            }
        }

        let mut edges = Vec::new();
        for (dependent, id) in graph.nodes.iter().enumerate() {
            for req in source.requirements(id) {
                let Some(providers) = by_capability.get(&req) else {
                    tracing::trace!(module = %id, requirement = %req, "no in-scope provider");
                    continue;
                };
                edges.extend(
                    providers
                        .iter()
                        .filter(|&&p| p != dependent)
                        .map(|&p| (dependent, p)),
                );
            }
        }
        graph.link(edges);
        graph
    }

    /// Build from explicit `(dependent, dependency)` pairs. Pairs naming a
    /// module outside `nodes` are dropped.
    pub fn from_edges(nodes: &[ModuleId], edges: &[(ModuleId, ModuleId)]) -> Self {
        let mut graph = Self::with_nodes(nodes);
        let pairs: Vec<(usize, usize)> = edges
            .iter()
            .filter_map(|(a, b)| Some((*graph.index.get(a)?, *graph.index.get(b)?)))
            .filter(|(a, b)| a != b)
            .collect();
        graph.link(pairs);
        graph
    }

    fn with_nodes(candidates: &[ModuleId]) -> Self {
        let mut nodes = Vec::with_capacity(candidates.len());
        let mut index = HashMap::with_capacity(candidates.len());
        for id in candidates {
            if !index.contains_key(id) {
                index.insert(id.clone(), nodes.len());
                nodes.push(id.clone());
            }
        }
        let n = nodes.len();
        Self {
            nodes,
            index,
            providers: vec![Vec::new(); n],
            dependents: vec![Vec::new(); n],
        }
    }

    fn link(&mut self, edges: Vec<(usize, usize)>) {
        for (dependent, dependency) in edges {
            self.providers[dependent].push(dependency);
            self.dependents[dependency].push(dependent);
        }
        for list in self.providers.iter_mut().chain(self.dependents.iter_mut()) {
            list.sort_unstable();
            list.dedup();
        }
    }

    pub fn nodes(&self) -> &[ModuleId] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &ModuleId) -> bool {
        self.index.contains_key(id)
    }

    pub(crate) fn index_of(&self, id: &ModuleId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub(crate) fn node(&self, idx: usize) -> &ModuleId {
        &self.nodes[idx]
    }

    pub(crate) fn neighbours(&self, idx: usize, direction: Direction) -> &[usize] {
        match direction {
            Direction::Providing => &self.providers[idx],
            Direction::Requiring => &self.dependents[idx],
        }
    }

    /// Direct dependencies of `id` within scope.
    pub fn providers_of(&self, id: &ModuleId) -> Vec<ModuleId> {
        self.collect(id, Direction::Providing)
    }

    /// Direct dependents of `id` within scope.
    pub fn dependents_of(&self, id: &ModuleId) -> Vec<ModuleId> {
        self.collect(id, Direction::Requiring)
    }

    fn collect(&self, id: &ModuleId, direction: Direction) -> Vec<ModuleId> {
        self.index_of(id)
            .map(|idx| {
                self.neighbours(idx, direction)
                    .iter()
                    .map(|&n| self.nodes[n].clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All `(dependent, dependency)` edges, in candidate order.
    pub fn edges(&self) -> Vec<(ModuleId, ModuleId)> {
        self.providers
            .iter()
            .enumerate()
            .flat_map(|(dependent, deps)| {
                deps.iter()
                    .map(move |&dep| (self.nodes[dependent].clone(), self.nodes[dep].clone()))
            })
            .collect()
    }
}
