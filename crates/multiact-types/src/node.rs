//! Node domain types for multiact.
//!
//! A `Node` is the atomic unit of work in a pipeline: a named step with named
//! input and output path lists and a `NodeKind` describing how a backend
//! should lower it. Nodes are identified by `NodeId`, never by name, so two
//! nodes with the same name are still distinct graph vertices.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::NodeError;

/// Logical name -> ordered list of path strings (local paths or remote URIs).
pub type PathMap = BTreeMap<String, Vec<String>>;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Opaque node identity (UUIDv7), assigned once at construction.
///
/// Cloning a `Node` keeps its id: the clone is the same graph vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Kinds
// ---------------------------------------------------------------------------

/// A containerized invocation: image, argument list and environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Image reference (e.g. "cellprofiler/cellprofiler:4.2.6").
    pub image: String,
    /// Command argument list run inside the container.
    #[serde(default)]
    pub command: Vec<String>,
    /// Environment variables set for the command.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl ContainerSpec {
    pub fn new(image: impl Into<String>, command: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            image: image.into(),
            command: command.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// One fan-out instance of a `ParContainer`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitOfWork {
    #[serde(default)]
    pub inputs: PathMap,
    #[serde(default)]
    pub outputs: PathMap,
}

impl UnitOfWork {
    pub fn new(inputs: PathMap, outputs: PathMap) -> Self {
        Self { inputs, outputs }
    }
}

/// How a node is executed. Backends lower each kind with an exhaustive match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// In-process callable, referenced by name, invoked with the node's paths.
    PureFunction {
        function: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        params: BTreeMap<String, serde_json::Value>,
    },
    /// Opaque shell command.
    Shell { command: String },
    /// Containerized invocation.
    Container(ContainerSpec),
    /// A group of containers sharing one invocation template, one per unit of work.
    ParContainer {
        template: ContainerSpec,
        units: Vec<UnitOfWork>,
    },
    /// Start of a parallel region. Carries no paths.
    Scatter,
    /// End of a parallel region, joins every branch. Carries no paths.
    Gather,
    /// Collaborator-defined kind. No built-in backend can lower it.
    Custom {
        kind: String,
        #[serde(default)]
        params: serde_json::Value,
    },
}

impl NodeKind {
    /// Short snake_case label used in logs and error messages.
    pub fn label(&self) -> &str {
        match self {
            NodeKind::PureFunction { .. } => "pure_function",
            NodeKind::Shell { .. } => "shell",
            NodeKind::Container(_) => "container",
            NodeKind::ParContainer { .. } => "par_container",
            NodeKind::Scatter => "scatter",
            NodeKind::Gather => "gather",
            NodeKind::Custom { kind, .. } => kind,
        }
    }

    /// Scatter and Gather are pure join points.
    pub fn is_marker(&self) -> bool {
        matches!(self, NodeKind::Scatter | NodeKind::Gather)
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// An atomic unit of work.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Node {
    id: NodeId,
    name: String,
    input_paths: PathMap,
    output_paths: PathMap,
    kind: NodeKind,
}

impl Node {
    /// Create a node with no paths. `ParContainer` paths are derived from its units.
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Result<Self, NodeError> {
        let name = name.into();
        validate_name(&name)?;

        let (input_paths, output_paths) = match &kind {
            NodeKind::ParContainer { units, .. } => (
                merge_paths(units.iter().map(|u| &u.inputs)),
                merge_paths(units.iter().map(|u| &u.outputs)),
            ),
            _ => (PathMap::new(), PathMap::new()),
        };

        Ok(Self {
            id: NodeId::new(),
            name,
            input_paths,
            output_paths,
            kind,
        })
    }

    pub fn shell(name: impl Into<String>, command: impl Into<String>) -> Result<Self, NodeError> {
        Self::new(
            name,
            NodeKind::Shell {
                command: command.into(),
            },
        )
    }

    pub fn pure_function(
        name: impl Into<String>,
        function: impl Into<String>,
    ) -> Result<Self, NodeError> {
        Self::new(
            name,
            NodeKind::PureFunction {
                function: function.into(),
                params: BTreeMap::new(),
            },
        )
    }

    pub fn container(name: impl Into<String>, spec: ContainerSpec) -> Result<Self, NodeError> {
        Self::new(name, NodeKind::Container(spec))
    }

    pub fn par_container(
        name: impl Into<String>,
        template: ContainerSpec,
        units: Vec<UnitOfWork>,
    ) -> Result<Self, NodeError> {
        Self::new(name, NodeKind::ParContainer { template, units })
    }

    pub fn scatter(name: impl Into<String>) -> Result<Self, NodeError> {
        Self::new(name, NodeKind::Scatter)
    }

    pub fn gather(name: impl Into<String>) -> Result<Self, NodeError> {
        Self::new(name, NodeKind::Gather)
    }

    /// Append paths under a logical input name.
    ///
    /// Rejected for markers (no path data) and par-containers (paths come from units).
    pub fn with_input<I, S>(mut self, key: impl Into<String>, paths: I) -> Result<Self, NodeError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ensure_paths_allowed()?;
        self.input_paths
            .entry(key.into())
            .or_default()
            .extend(paths.into_iter().map(Into::into));
        Ok(self)
    }

    /// Append paths under a logical output name. Same restrictions as `with_input`.
    pub fn with_output<I, S>(mut self, key: impl Into<String>, paths: I) -> Result<Self, NodeError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ensure_paths_allowed()?;
        self.output_paths
            .entry(key.into())
            .or_default()
            .extend(paths.into_iter().map(Into::into));
        Ok(self)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn input_paths(&self) -> &PathMap {
        &self.input_paths
    }

    pub fn output_paths(&self) -> &PathMap {
        &self.output_paths
    }

    /// Realize a `ParContainer`'s units as distinct `Container` nodes named
    /// `<name>_<index>`. Empty for every other kind.
    pub fn expand_units(&self) -> Vec<Node> {
        let NodeKind::ParContainer { template, units } = &self.kind else {
            return Vec::new();
        };

        units
            .iter()
            .enumerate()
            .map(|(i, unit)| Node {
                id: NodeId::new(),
                name: format!("{}_{}", self.name, i),
                input_paths: unit.inputs.clone(),
                output_paths: unit.outputs.clone(),
                kind: NodeKind::Container(template.clone()),
            })
            .collect()
    }

    fn ensure_paths_allowed(&self) -> Result<(), NodeError> {
        match &self.kind {
            NodeKind::Scatter | NodeKind::Gather | NodeKind::ParContainer { .. } => {
                Err(NodeError::PathsNotAllowed {
                    name: self.name.clone(),
                    kind: self.kind.label().to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

/// Node names double as rule identifiers in generated workflow files:
/// ASCII alphanumerics and `_`, not starting with a digit.
pub fn validate_name(name: &str) -> Result<(), NodeError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };

    if valid {
        Ok(())
    } else {
        Err(NodeError::InvalidName(name.to_string()))
    }
}

fn merge_paths<'a>(maps: impl Iterator<Item = &'a PathMap>) -> PathMap {
    let mut merged = PathMap::new();
    for map in maps {
        for (key, paths) in map {
            merged
                .entry(key.clone())
                .or_default()
                .extend(paths.iter().cloned());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(input: &str, output: &str) -> UnitOfWork {
        UnitOfWork::new(
            PathMap::from([("image".to_string(), vec![input.to_string()])]),
            PathMap::from([("mask".to_string(), vec![output.to_string()])]),
        )
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("segment_nuclei").is_ok());
        assert!(validate_name("_private").is_ok());
        assert!(validate_name("step2").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("2step").is_err());
        assert!(validate_name("has-hyphen").is_err());
        assert!(validate_name("has space").is_err());
    }

    #[test]
    fn test_shell_node_with_paths() {
        let node = Node::shell("index", "index.sh")
            .unwrap()
            .with_input("images", ["a.tif", "b.tif"])
            .unwrap()
            .with_output("csv", ["index.csv"])
            .unwrap();

        assert_eq!(node.name(), "index");
        assert_eq!(node.input_paths()["images"], vec!["a.tif", "b.tif"]);
        assert_eq!(node.output_paths()["csv"], vec!["index.csv"]);
        assert_eq!(node.kind().label(), "shell");
    }

    #[test]
    fn test_markers_reject_paths() {
        let err = Node::scatter("fan_out")
            .unwrap()
            .with_input("x", ["a"])
            .unwrap_err();
        assert!(err.to_string().contains("scatter"), "got: {err}");

        let gather = Node::gather("fan_in").unwrap();
        assert!(gather.input_paths().is_empty());
        assert!(gather.output_paths().is_empty());
        assert!(gather.kind().is_marker());
    }

    #[test]
    fn test_distinct_nodes_have_distinct_ids() {
        let a = Node::shell("same", "true").unwrap();
        let b = Node::shell("same", "true").unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
    }

    #[test]
    fn test_par_container_paths_merge_units() {
        let node = Node::par_container(
            "segment",
            ContainerSpec::new("cellprofiler:4", ["cellprofiler", "-c"]),
            vec![unit("p1.tif", "p1.png"), unit("p2.tif", "p2.png")],
        )
        .unwrap();

        assert_eq!(node.input_paths()["image"], vec!["p1.tif", "p2.tif"]);
        assert_eq!(node.output_paths()["mask"], vec!["p1.png", "p2.png"]);
        assert!(node.clone().with_output("extra", ["x"]).is_err());
    }

    #[test]
    fn test_expand_units() {
        let node = Node::par_container(
            "segment",
            ContainerSpec::new("cellprofiler:4", ["cellprofiler"]).with_env("THREADS", "2"),
            vec![unit("p1.tif", "p1.png"), unit("p2.tif", "p2.png")],
        )
        .unwrap();

        let expanded = node.expand_units();
        assert_eq!(expanded.len(), 2);
        assert_eq!(expanded[0].name(), "segment_0");
        assert_eq!(expanded[1].name(), "segment_1");
        assert_eq!(expanded[1].input_paths()["image"], vec!["p2.tif"]);
        match expanded[0].kind() {
            NodeKind::Container(spec) => {
                assert_eq!(spec.image, "cellprofiler:4");
                assert_eq!(spec.env["THREADS"], "2");
            }
            other => panic!("expected container, got {other:?}"),
        }

        let plain = Node::shell("plain", "true").unwrap();
        assert!(plain.expand_units().is_empty());
    }

    #[test]
    fn test_node_kind_yaml_tagging() {
        let kind: NodeKind = serde_json::from_str(
            r#"{"type":"container","image":"fiji:latest","command":["fiji","--headless"]}"#,
        )
        .unwrap();
        assert_eq!(
            kind,
            NodeKind::Container(ContainerSpec::new("fiji:latest", ["fiji", "--headless"]))
        );

        let kind: NodeKind = serde_json::from_str(r#"{"type":"scatter"}"#).unwrap();
        assert_eq!(kind, NodeKind::Scatter);
    }
}
