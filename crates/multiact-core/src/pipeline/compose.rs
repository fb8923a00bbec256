//! Sequential and parallel pipeline composition.
//!
//! A `Pipeline` is either a `Seq` (children run left to right) or a
//! `Parallel` (children are independent, fanned out from a synthetic
//! `Scatter` node and joined by a synthetic `Gather` node). Children are
//! shared `Node`s or nested `Pipeline`s, so one sub-pipeline can be reused in
//! several compositions.
//!
//! `compile()` turns the tree into a `PipelineGraph`:
//!
//! - `Seq([A, B, C])` -> A -> B -> C. A nested pipeline is entered at its
//!   first leaf and left from its last leaf.
//! - `Parallel([A, B])` -> Scatter -> {A, B} -> Gather. Gather is a full
//!   barrier: it depends on every branch.
//!
//! The graph is computed once and cached; later calls return the cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use multiact_types::node::Node;

use super::definition::PipelineError;
use super::graph::PipelineGraph;
use super::resolve::{self, Resolved};

/// Source of default pipeline names (`seq_<n>`, `parallel_<n>`).
static PIPELINE_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_name(prefix: &str) -> String {
    format!("{prefix}_{}", PIPELINE_COUNTER.fetch_add(1, Ordering::Relaxed))
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// One child of a pipeline.
#[derive(Debug, Clone)]
pub enum Step {
    Node(Arc<Node>),
    Pipeline(Arc<Pipeline>),
}

impl From<Node> for Step {
    fn from(node: Node) -> Self {
        Step::Node(Arc::new(node))
    }
}

impl From<Arc<Node>> for Step {
    fn from(node: Arc<Node>) -> Self {
        Step::Node(node)
    }
}

impl From<Pipeline> for Step {
    fn from(pipeline: Pipeline) -> Self {
        Step::Pipeline(Arc::new(pipeline))
    }
}

impl From<Arc<Pipeline>> for Step {
    fn from(pipeline: Arc<Pipeline>) -> Self {
        Step::Pipeline(pipeline)
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Composition semantics of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    Seq,
    Parallel,
}

/// A composite of nodes and nested pipelines.
#[derive(Debug)]
pub struct Pipeline {
    kind: PipelineKind,
    name: String,
    node_list: Vec<Step>,
    resolved_list: Vec<Resolved>,
    graph: OnceLock<PipelineGraph>,
}

impl Pipeline {
    /// Children run strictly left to right.
    pub fn seq(steps: Vec<Step>) -> Self {
        Self::build(PipelineKind::Seq, next_name("seq"), steps)
    }

    /// Children run independently between a synthetic Scatter and Gather.
    pub fn parallel(steps: Vec<Step>) -> Result<Self, PipelineError> {
        Self::parallel_named(next_name("parallel"), steps)
    }

    /// Like `parallel`; the markers are named `<name>_scatter` and `<name>_gather`.
    pub fn parallel_named(
        name: impl Into<String>,
        steps: Vec<Step>,
    ) -> Result<Self, PipelineError> {
        let name = name.into();
        let scatter = Node::scatter(format!("{name}_scatter"))?;
        let gather = Node::gather(format!("{name}_gather"))?;

        let mut node_list = Vec::with_capacity(steps.len() + 2);
        node_list.push(Step::from(scatter));
        node_list.extend(steps);
        node_list.push(Step::from(gather));

        Ok(Self::build(PipelineKind::Parallel, name, node_list))
    }

    fn build(kind: PipelineKind, name: String, node_list: Vec<Step>) -> Self {
        let resolved_list = resolve::resolve(&node_list);
        Self {
            kind,
            name,
            node_list,
            resolved_list,
            graph: OnceLock::new(),
        }
    }

    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared children. For a `Parallel` this includes the Scatter/Gather markers.
    pub fn node_list(&self) -> &[Step] {
        &self.node_list
    }

    pub fn resolved_list(&self) -> &[Resolved] {
        &self.resolved_list
    }

    /// Every leaf node in declaration order.
    pub fn leaves(&self) -> Vec<Arc<Node>> {
        resolve::flatten(&self.resolved_list)
    }

    pub fn is_compiled(&self) -> bool {
        self.graph.get().is_some()
    }

    /// The compiled graph, if `compile()` has succeeded.
    pub fn graph(&self) -> Option<&PipelineGraph> {
        self.graph.get()
    }

    /// Compile into a dependency graph. Idempotent: once compiled, the cached
    /// graph is returned without re-wiring. A failed compile caches nothing.
    pub fn compile(&self) -> Result<&PipelineGraph, PipelineError> {
        if let Some(graph) = self.graph.get() {
            return Ok(graph);
        }

        let graph = match self.kind {
            PipelineKind::Seq => self.compile_seq()?,
            PipelineKind::Parallel => self.compile_parallel()?,
        };
        graph.validate()?;

        tracing::debug!(
            pipeline = %self.name,
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            "compiled pipeline"
        );
        Ok(self.graph.get_or_init(|| graph))
    }

    fn compile_seq(&self) -> Result<PipelineGraph, PipelineError> {
        let mut graph = PipelineGraph::new();
        let mut prev_root: Option<Arc<Node>> = None;

        for (step, resolved) in self.node_list.iter().zip(&self.resolved_list) {
            let entry = std::slice::from_ref(resolved);
            let (first, last) = match step {
                Step::Node(node) => {
                    graph.add_node(node);
                    (Arc::clone(node), Arc::clone(node))
                }
                Step::Pipeline(pipeline) => {
                    graph.union(pipeline.compile()?);
                    match (resolve::first_node(entry), resolve::last_node(entry)) {
                        (Some(first), Some(last)) => (Arc::clone(first), Arc::clone(last)),
                        // An empty nested Seq contributes nothing.
                        _ => continue,
                    }
                }
            };

            if let Some(prev) = &prev_root {
                graph.add_edge(prev, &first);
            }
            prev_root = Some(last);
        }

        Ok(graph)
    }

    fn compile_parallel(&self) -> Result<PipelineGraph, PipelineError> {
        let (Some(scatter), Some(gather)) = (
            resolve::first_node(&self.resolved_list),
            resolve::last_node(&self.resolved_list),
        ) else {
            return Err(PipelineError::Composition(format!(
                "parallel pipeline '{}' is missing its scatter/gather markers",
                self.name
            )));
        };

        let mut graph = PipelineGraph::new();
        graph.add_node(scatter);
        graph.add_node(gather);
        let mut branches = 0usize;

        for (step, resolved) in self.node_list.iter().zip(&self.resolved_list) {
            match step {
                Step::Node(node) if node.id() == scatter.id() || node.id() == gather.id() => {
                    continue;
                }
                Step::Node(node) => {
                    graph.add_edge(scatter, node);
                    graph.add_edge(node, gather);
                }
                Step::Pipeline(pipeline) => {
                    graph.union(pipeline.compile()?);
                    let entry = std::slice::from_ref(resolved);
                    let (Some(first), Some(last)) =
                        (resolve::first_node(entry), resolve::last_node(entry))
                    else {
                        continue;
                    };
                    graph.add_edge(scatter, first);
                    graph.add_edge(last, gather);
                }
            }
            branches += 1;
        }

        // Keep Scatter -> Gather ordered when there is nothing in between.
        if branches == 0 {
            graph.add_edge(scatter, gather);
        }

        Ok(graph)
    }
}
