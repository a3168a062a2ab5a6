//! Dependency graph view over a workflow using petgraph.
//!
//! Provides cycle detection, reachability and topological layering. The
//! graph is built tolerantly: duplicate step ids and dependencies on
//! missing steps are recorded instead of rejected, so the validator can
//! report every problem at once.

use crate::error::FlowError;
use crate::model::{Step, StepId, Workflow};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet, VecDeque};

/// DFS colouring used by cycle detection.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Directed graph of step dependencies.
///
/// Edges point from a dependency to its dependent (`a -> b` means `b`
/// depends on `a`). Node weights index into [`Workflow::steps`].
pub struct DependencyGraph<'a> {
    workflow: &'a Workflow,
    graph: DiGraph<usize, ()>,
    index: HashMap<&'a StepId, NodeIndex>,
    duplicates: Vec<StepId>,
    missing: Vec<(StepId, StepId)>,
}

impl<'a> DependencyGraph<'a> {
    /// Builds the graph for a workflow.
    ///
    /// Only the first step with a given id becomes a node; later duplicates
    /// are recorded in [`duplicates`](Self::duplicates).
    pub fn from_workflow(workflow: &'a Workflow) -> Self {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        let mut duplicates = Vec::new();
        let mut missing = Vec::new();

        for (position, step) in workflow.steps().iter().enumerate() {
            if index.contains_key(step.id()) {
                duplicates.push(step.id().clone());
                continue;
            }
            let idx = graph.add_node(position);
            index.insert(step.id(), idx);
        }

        for (position, step) in workflow.steps().iter().enumerate() {
            let to = index[step.id()];
            if graph[to] != position {
                // Duplicate declaration; its edges belong to the first one.
                continue;
            }
            for dependency in step.dependencies() {
                match index.get(dependency) {
                    Some(&from) => {
                        graph.update_edge(from, to, ());
                    }
                    None => missing.push((step.id().clone(), dependency.clone())),
                }
            }
        }

        Self {
            workflow,
            graph,
            index,
            duplicates,
            missing,
        }
    }

    /// Step ids declared more than once, in declaration order.
    pub fn duplicates(&self) -> &[StepId] {
        &self.duplicates
    }

    /// `(step, dependency)` pairs whose dependency does not exist.
    pub fn missing_dependencies(&self) -> &[(StepId, StepId)] {
        &self.missing
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    fn step_at(&self, idx: NodeIndex) -> &'a Step {
        &self.workflow.steps()[self.graph[idx]]
    }

    fn id_at(&self, idx: NodeIndex) -> StepId {
        self.step_at(idx).id().clone()
    }

    /// Steps that directly depend on `id`.
    pub fn dependents(&self, id: &StepId) -> Result<Vec<&'a Step>, FlowError> {
        let idx = self
            .index
            .get(id)
            .ok_or_else(|| FlowError::StepNotFound(id.clone()))?;
        let mut dependents: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(*idx, Direction::Outgoing)
            .collect();
        dependents.sort_by_key(|&n| self.graph[n]);
        Ok(dependents.into_iter().map(|n| self.step_at(n)).collect())
    }

    /// Returns every cycle found by a depth-first traversal.
    ///
    /// Each back-edge into the active recursion stack yields one cycle,
    /// listed from the re-entered step to the step closing the loop.
    /// Traversal starts from each unvisited step in declaration order, so
    /// the result is deterministic.
    pub fn cycles(&self) -> Vec<Vec<StepId>> {
        let mut marks = vec![Mark::Unvisited; self.graph.node_count()];
        let mut stack = Vec::new();
        let mut cycles = Vec::new();

        for idx in self.ordered_nodes() {
            if marks[idx.index()] == Mark::Unvisited {
                self.visit(idx, &mut marks, &mut stack, &mut cycles);
            }
        }

        cycles
    }

    /// Returns true if the dependency relation contains a cycle.
    pub fn has_cycle(&self) -> bool {
        !self.cycles().is_empty()
    }

    /// Depth-first walk from `root` with an explicit frame stack.
    ///
    /// `stack` mirrors the active path, so a back-edge into it closes a
    /// cycle. Depth is bounded by the heap, not the thread stack.
    fn visit(
        &self,
        root: NodeIndex,
        marks: &mut [Mark],
        stack: &mut Vec<NodeIndex>,
        cycles: &mut Vec<Vec<StepId>>,
    ) {
        let mut frames: Vec<(NodeIndex, Vec<NodeIndex>, usize)> = Vec::new();
        marks[root.index()] = Mark::InProgress;
        stack.push(root);
        frames.push((root, self.ordered_neighbors(root), 0));

        while let Some((idx, neighbors, cursor)) = frames.last_mut() {
            let Some(&next) = neighbors.get(*cursor) else {
                marks[idx.index()] = Mark::Done;
                stack.pop();
                frames.pop();
                continue;
            };
            *cursor += 1;

            match marks[next.index()] {
                Mark::Unvisited => {
                    marks[next.index()] = Mark::InProgress;
                    stack.push(next);
                    frames.push((next, self.ordered_neighbors(next), 0));
                }
                Mark::InProgress => {
                    if let Some(start) = stack.iter().position(|&n| n == next) {
                        cycles.push(stack[start..].iter().map(|&n| self.id_at(n)).collect());
                    }
                }
                Mark::Done => {}
            }
        }
    }

    /// Steps reachable by following edges forward from the root set.
    ///
    /// Roots are steps that declare no dependencies at all.
    pub fn reachable_from_roots(&self) -> HashSet<StepId> {
        let mut visited: HashSet<NodeIndex> = HashSet::new();
        let mut queue: VecDeque<NodeIndex> = self
            .ordered_nodes()
            .into_iter()
            .filter(|&idx| self.step_at(idx).dependencies().is_empty())
            .collect();

        while let Some(idx) = queue.pop_front() {
            if !visited.insert(idx) {
                continue;
            }
            for next in self.ordered_neighbors(idx) {
                if !visited.contains(&next) {
                    queue.push_back(next);
                }
            }
        }

        visited.into_iter().map(|idx| self.id_at(idx)).collect()
    }

    /// Steps never visited from the root set, in declaration order.
    pub fn unreachable(&self) -> Vec<StepId> {
        let reachable = self.reachable_from_roots();
        self.ordered_nodes()
            .into_iter()
            .map(|idx| self.id_at(idx))
            .filter(|id| !reachable.contains(id))
            .collect()
    }

    /// Groups steps into topological layers.
    ///
    /// Layer `n` holds the steps whose dependencies all sit in layers
    /// `0..n`. Steps within a layer keep declaration order.
    ///
    /// # Returns
    ///
    /// - `Ok(layers)` for an acyclic graph
    /// - `Err(FlowError::EmptyWorkflow)` if the workflow has no steps
    /// - `Err(FlowError::CycleDetected)` with the steps that could not be layered
    pub fn layers(&self) -> Result<Vec<Vec<StepId>>, FlowError> {
        if self.graph.node_count() == 0 {
            return Err(FlowError::EmptyWorkflow);
        }

        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|idx| {
                let degree = self
                    .graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .count();
                (idx, degree)
            })
            .collect();

        let mut current: Vec<NodeIndex> = self
            .ordered_nodes()
            .into_iter()
            .filter(|idx| in_degree[idx] == 0)
            .collect();
        let mut layers = Vec::new();
        let mut placed = 0;

        while !current.is_empty() {
            placed += current.len();
            let mut next = Vec::new();
            for &idx in &current {
                for dependent in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                    if let Some(degree) = in_degree.get_mut(&dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(dependent);
                        }
                    }
                }
            }
            next.sort_by_key(|&n| self.graph[n]);
            layers.push(current.iter().map(|&idx| self.id_at(idx)).collect());
            current = next;
        }

        if placed < self.graph.node_count() {
            let blocked = self
                .ordered_nodes()
                .into_iter()
                .filter(|idx| in_degree[idx] > 0)
                .map(|idx| self.id_at(idx))
                .collect();
            return Err(FlowError::CycleDetected(blocked));
        }

        Ok(layers)
    }

    fn ordered_nodes(&self) -> Vec<NodeIndex> {
        let mut nodes: Vec<NodeIndex> = self.graph.node_indices().collect();
        nodes.sort_by_key(|&idx| self.graph[idx]);
        nodes
    }

    fn ordered_neighbors(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        let mut neighbors: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .collect();
        neighbors.sort_by_key(|&n| self.graph[n]);
        neighbors
    }
}
