//! Closure Sorter
//!
//! Depth-first traversal over a [`DependencyGraph`] in either direction,
//! producing a dependency-ordered sequence. Cycles are found as strongly
//! connected components: each component is either rejected with its exact
//! membership or kept together as one block.

use std::fmt;

use thiserror::Error;

pub use crate::graph::Direction;
use crate::graph::DependencyGraph;
use crate::model::ModuleId;

/// A cycle was found while `allow_cycles` was off.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("dependency cycle detected among modules: {}", join(.members))]
pub struct CycleError {
    /// Modules ordered before the traversal aborted.
    pub partial: Vec<ModuleId>,
    /// Exactly the members of the cycle, in candidate order.
    pub members: Vec<ModuleId>,
}

fn join(ids: &[ModuleId]) -> String {
    ids.iter()
        .map(ModuleId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// An ordered closure. Modules of a tolerated cycle sit next to each other
/// in one block; every other block has a single member.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Closure {
    order: Vec<ModuleId>,
    blocks: Vec<Vec<ModuleId>>,
}

impl Closure {
    fn from_blocks(blocks: Vec<Vec<ModuleId>>) -> Self {
        let order = blocks.iter().flatten().cloned().collect();
        Self { order, blocks }
    }

    pub fn modules(&self) -> &[ModuleId] {
        &self.order
    }

    pub fn into_modules(self) -> Vec<ModuleId> {
        self.order
    }

    pub fn blocks(&self) -> &[Vec<ModuleId>] {
        &self.blocks
    }

    /// Tolerated cycles, in traversal order.
    pub fn cycles(&self) -> Vec<Vec<ModuleId>> {
        self.blocks.iter().filter(|b| b.len() > 1).cloned().collect()
    }

    pub fn contains(&self, id: &ModuleId) -> bool {
        self.order.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl fmt::Display for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .blocks
            .iter()
            .map(|b| match b.as_slice() {
                [single] => single.to_string(),
                many => format!("[{}]", join(many)),
            })
            .collect();
        f.write_str(&parts.join(" -> "))
    }
}

/// Read-only sorter over one graph.
pub struct ClosureSorter<'g> {
    graph: &'g DependencyGraph,
}

impl<'g> ClosureSorter<'g> {
    pub fn new(graph: &'g DependencyGraph) -> Self {
        Self { graph }
    }

    /// Dependencies first.
    pub fn sort_providing(
        &self,
        seed: &[ModuleId],
        allow_cycles: bool,
    ) -> Result<Closure, CycleError> {
        self.sort(seed, Direction::Providing, allow_cycles)
    }

    /// Dependents first.
    pub fn sort_requiring(
        &self,
        seed: &[ModuleId],
        allow_cycles: bool,
    ) -> Result<Closure, CycleError> {
        self.sort(seed, Direction::Requiring, allow_cycles)
    }

    pub fn sort(
        &self,
        seed: &[ModuleId],
        direction: Direction,
        allow_cycles: bool,
    ) -> Result<Closure, CycleError> {
        let mut walk = Walk {
            graph: self.graph,
            direction,
            allow_cycles,
            visit: vec![Visit::Unvisited; self.graph.len()],
            next_index: 0,
            stack: Vec::new(),
            blocks: Vec::new(),
        };

        for id in seed {
            let Some(idx) = self.graph.index_of(id) else {
                tracing::debug!(module = %id, "seed outside closure scope ignored");
                continue;
            };
            if matches!(walk.visit[idx], Visit::Unvisited) {
                if let Err(members) = walk.strong_connect(idx) {
                    return Err(CycleError {
                        partial: walk.resolved(walk.blocks.iter().flatten().copied()),
                        members: walk.resolved(members.into_iter()),
                    });
                }
            }
        }

        let blocks = walk
            .blocks
            .iter()
            .map(|b| walk.resolved(b.iter().copied()))
            .collect();
        Ok(Closure::from_blocks(blocks))
    }
}

/// Sort `seed` over `graph` in `direction`.
pub fn compute_closure(
    graph: &DependencyGraph,
    seed: &[ModuleId],
    direction: Direction,
    allow_cycles: bool,
) -> Result<Closure, CycleError> {
    ClosureSorter::new(graph).sort(seed, direction, allow_cycles)
}

#[derive(Clone, Copy, Debug)]
enum Visit {
    Unvisited,
    /// On the traversal stack.
    InProgress { index: usize, low: usize },
    Done,
}

struct Walk<'g> {
    graph: &'g DependencyGraph,
    direction: Direction,
    allow_cycles: bool,
    visit: Vec<Visit>,
    next_index: usize,
    stack: Vec<usize>,
    blocks: Vec<Vec<usize>>,
}

impl Walk<'_> {
    fn resolved(&self, idxs: impl Iterator<Item = usize>) -> Vec<ModuleId> {
        idxs.map(|i| self.graph.node(i).clone()).collect()
    }

    fn lower(&mut self, v: usize, to: usize) {
        if let Visit::InProgress { low, .. } = &mut self.visit[v] {
            *low = (*low).min(to);
        }
    }

    /// Tarjan's walk from `root` with an explicit frame stack, so deep
    /// dependency chains do not grow the call stack. Returns the members of a
    /// rejected cycle as `Err`.
    fn strong_connect(&mut self, root: usize) -> Result<(), Vec<usize>> {
        let graph = self.graph;
        let direction = self.direction;
        // (node, position of the next neighbour to visit)
        let mut frames: Vec<(usize, usize)> = vec![(root, 0)];
        self.enter(root);

        while let Some(frame) = frames.last_mut() {
            let (v, pos) = *frame;
            if let Some(&w) = graph.neighbours(v, direction).get(pos) {
                frame.1 += 1;
                match self.visit[w] {
                    Visit::Unvisited => {
                        self.enter(w);
                        frames.push((w, 0));
                    }
                    Visit::InProgress { index: w_index, .. } => self.lower(v, w_index),
                    Visit::Done => {}
                }
                continue;
            }

            frames.pop();
            self.close(v)?;
            if let (Some(&(parent, _)), Visit::InProgress { low, .. }) =
                (frames.last(), self.visit[v])
            {
                self.lower(parent, low);
            }
        }
        Ok(())
    }

    fn enter(&mut self, v: usize) {
        let index = self.next_index;
        self.next_index += 1;
        self.visit[v] = Visit::InProgress { index, low: index };
        self.stack.push(v);
    }

    /// Pop `v`'s component once every neighbour has been visited, if `v` is its root.
    fn close(&mut self, v: usize) -> Result<(), Vec<usize>> {
        let Visit::InProgress { index, low } = self.visit[v] else {
            return Ok(());
        };
        if low != index {
            return Ok(());
        }

        let mut component = Vec::new();
        while let Some(w) = self.stack.pop() {
            self.visit[w] = Visit::Done;
            component.push(w);
            if w == v {
                break;
            }
        }
        component.sort_unstable();

        if component.len() > 1 && !self.allow_cycles {
            return Err(component);
        }
        self.blocks.push(component);
        Ok(())
    }
}
