//! Dependency graph produced by compiling a pipeline.
//!
//! Wraps a `petgraph::DiGraph` whose weights are shared `Node`s. Vertices are
//! keyed by `NodeId`, so merging the graph of a nested pipeline into its
//! parent (`union`) never duplicates a node and never confuses two distinct
//! nodes that happen to share a name.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use multiact_types::node::{Node, NodeId};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use super::definition::PipelineError;

/// Directed graph of nodes and dependency edges (`a -> b`: b runs after a).
#[derive(Debug, Clone, Default)]
pub struct PipelineGraph {
    graph: DiGraph<Arc<Node>, ()>,
    index: HashMap<NodeId, NodeIndex>,
}

impl PipelineGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `node` unless a vertex with the same id already exists.
    pub fn add_node(&mut self, node: &Arc<Node>) -> NodeIndex {
        *self
            .index
            .entry(node.id())
            .or_insert_with(|| self.graph.add_node(Arc::clone(node)))
    }

    /// Add the edge `from -> to`, inserting either endpoint if needed.
    /// Adding an existing edge again is a no-op.
    pub fn add_edge(&mut self, from: &Arc<Node>, to: &Arc<Node>) {
        let a = self.add_node(from);
        let b = self.add_node(to);
        self.graph.update_edge(a, b, ());
    }

    /// Merge every vertex and edge of `other` into this graph by node identity.
    pub fn union(&mut self, other: &PipelineGraph) {
        for idx in other.graph.node_indices() {
            self.add_node(&other.graph[idx]);
        }
        for edge in other.graph.edge_references() {
            self.add_edge(&other.graph[edge.source()], &other.graph[edge.target()]);
        }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains_node(&self, node: &Node) -> bool {
        self.index.contains_key(&node.id())
    }

    pub fn contains_edge(&self, from: &Node, to: &Node) -> bool {
        match (self.index.get(&from.id()), self.index.get(&to.id())) {
            (Some(&a), Some(&b)) => self.graph.find_edge(a, b).is_some(),
            _ => false,
        }
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.graph.node_weights()
    }

    /// Edges as `(from, to)` pairs in insertion order.
    pub fn edges(&self) -> impl Iterator<Item = (&Arc<Node>, &Arc<Node>)> {
        self.graph
            .edge_references()
            .map(|e| (&self.graph[e.source()], &self.graph[e.target()]))
    }

    /// Direct dependencies of `node`, in insertion order. Empty if unknown.
    pub fn predecessors(&self, node: &Node) -> Vec<&Arc<Node>> {
        self.neighbors(node, Direction::Incoming)
    }

    /// Direct dependents of `node`, in insertion order. Empty if unknown.
    pub fn successors(&self, node: &Node) -> Vec<&Arc<Node>> {
        self.neighbors(node, Direction::Outgoing)
    }

    /// Nodes without incoming edges.
    pub fn roots(&self) -> Vec<&Arc<Node>> {
        self.boundary(Direction::Incoming)
    }

    /// Nodes without outgoing edges.
    pub fn sinks(&self) -> Vec<&Arc<Node>> {
        self.boundary(Direction::Outgoing)
    }

    /// Nodes ordered so every node comes after all of its dependencies.
    pub fn topological_order(&self) -> Result<Vec<Arc<Node>>, PipelineError> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let node = &self.graph[cycle.node_id()];
            PipelineError::CycleDetected(format!("cycle detected involving node '{}'", node.name()))
        })?;
        Ok(sorted
            .into_iter()
            .map(|idx| Arc::clone(&self.graph[idx]))
            .collect())
    }

    /// Check that names are unique among distinct nodes and that the graph is acyclic.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let mut seen = HashSet::new();
        for node in self.graph.node_weights() {
            if !seen.insert(node.name()) {
                return Err(PipelineError::DuplicateNodeName(node.name().to_string()));
            }
        }

        self.topological_order()?;
        Ok(())
    }

    fn neighbors(&self, node: &Node, direction: Direction) -> Vec<&Arc<Node>> {
        let Some(&idx) = self.index.get(&node.id()) else {
            return Vec::new();
        };
        let mut found: Vec<NodeIndex> = self.graph.neighbors_directed(idx, direction).collect();
        found.sort();
        found.into_iter().map(|i| &self.graph[i]).collect()
    }

    fn boundary(&self, direction: Direction) -> Vec<&Arc<Node>> {
        self.graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, direction)
                    .next()
                    .is_none()
            })
            .map(|idx| &self.graph[idx])
            .collect()
    }
}
