use petgraph::{
    algo::toposort,
    graph::{DiGraph, NodeIndex},
    visit::EdgeRef,
    Direction,
};
use std::collections::{HashMap, HashSet};

use crate::error::FlowError;

/// Named stages and their dependency edges.
///
/// Edges point from a dependency to its dependent, so a topological sort
/// yields dependencies first.
#[derive(Debug, Default)]
pub struct TaskGraph {
    graph: DiGraph<String, ()>,
    node_map: HashMap<String, NodeIndex>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_stage(&mut self, name: &str) -> Result<NodeIndex, FlowError> {
        if self.node_map.contains_key(name) {
            return Err(FlowError::DuplicateStage(name.to_string()));
        }
        let idx = self.graph.add_node(name.to_string());
        self.node_map.insert(name.to_string(), idx);
        Ok(idx)
    }

    /// `stage` runs only after `depends_on` succeeded. Both must exist.
    pub fn add_dependency(&mut self, stage: &str, depends_on: &str) -> Result<(), FlowError> {
        let unknown = |dependency: &str| FlowError::UnknownDependency {
            stage: stage.to_string(),
            dependency: dependency.to_string(),
        };
        let to = *self.node_map.get(stage).ok_or_else(|| unknown(stage))?;
        let from = *self.node_map.get(depends_on).ok_or_else(|| unknown(depends_on))?;
        self.graph.update_edge(from, to, ());
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.node_map.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Stage names, dependencies first.
    pub fn topological_order(&self) -> Result<Vec<String>, FlowError> {
        match toposort(&self.graph, None) {
            Ok(indices) => Ok(indices
                .into_iter()
                .map(|idx| self.graph[idx].clone())
                .collect()),
            Err(cycle) => Err(FlowError::CircularDependency {
                cycle: self.find_cycle_path(cycle.node_id()),
            }),
        }
    }

    /// Direct dependencies of `stage`.
    pub fn dependencies(&self, stage: &str) -> Vec<String> {
        let Some(&idx) = self.node_map.get(stage) else {
            return Vec::new();
        };
        let mut deps: Vec<String> = self
            .graph
            .edges_directed(idx, Direction::Incoming)
            .map(|e| self.graph[e.source()].clone())
            .collect();
        deps.sort();
        deps
    }

    fn find_cycle_path(&self, start: NodeIndex) -> String {
        let mut path = vec![self.graph[start].clone()];
        let mut current = start;
        let mut visited = HashSet::from([start]);
        while let Some(edge) = self.graph.edges(current).next() {
            let target = edge.target();
            path.push(self.graph[target].clone());
            if !visited.insert(target) {
                break;
            }
            current = target;
        }
        path.join(" -> ")
    }
}
