//! Declarative pipeline definitions.
//!
//! Converts YAML documents into `Pipeline` trees. Every entry is exactly one
//! of `node`, `seq` or `parallel`:
//!
//! ```yaml
//! seq:
//!   - node: { name: index, type: shell, command: "index.sh", outputs: { csv: [index.csv] } }
//!   - parallel:
//!       name: plates
//!       steps:
//!         - node: { name: fiji, type: container, image: "fiji:latest", command: [fiji] }
//!         - seq: [ ... ]
//! ```
//!
//! Malformed entries are composition errors raised while building, before
//! anything is compiled.

use std::path::Path;
use std::sync::Arc;

use multiact_types::error::NodeError;
use multiact_types::node::{Node, NodeKind, PathMap};
use serde_yaml_ng::{Mapping, Value};
use thiserror::Error;

use super::compose::{Pipeline, Step};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while building or compiling pipelines.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// An entry is neither a node nor a pipeline, or is otherwise malformed.
    #[error("composition error: {0}")]
    Composition(String),

    /// Node construction failed.
    #[error(transparent)]
    Node(#[from] NodeError),

    /// Two distinct nodes in one compiled graph share a name.
    #[error("duplicate node name '{0}'")]
    DuplicateNodeName(String),

    /// Dependency graph contains a cycle.
    #[error("cycle detected: {0}")]
    CycleDetected(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// `type` values lowered to built-in node kinds; anything else becomes `Custom`.
const BUILTIN_KINDS: &[&str] = &[
    "pure_function",
    "shell",
    "container",
    "par_container",
    "scatter",
    "gather",
];

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML document into a pipeline. The top level must be `seq` or `parallel`.
pub fn parse_pipeline_yaml(yaml: &str) -> Result<Arc<Pipeline>, PipelineError> {
    let value: Value =
        serde_yaml_ng::from_str(yaml).map_err(|e| PipelineError::ParseError(e.to_string()))?;

    match build_step(&value, "$")? {
        Step::Pipeline(pipeline) => Ok(pipeline),
        Step::Node(node) => Err(PipelineError::Composition(format!(
            "top-level entry must be 'seq' or 'parallel', found node '{}'",
            node.name()
        ))),
    }
}

/// Load a pipeline definition from a YAML file.
pub fn load_pipeline_file(path: &Path) -> Result<Arc<Pipeline>, PipelineError> {
    let content = std::fs::read_to_string(path)?;
    parse_pipeline_yaml(&content)
}

fn build_step(value: &Value, at: &str) -> Result<Step, PipelineError> {
    let Value::Mapping(map) = value else {
        return Err(PipelineError::Composition(format!(
            "{at}: expected one of 'node', 'seq', 'parallel', found {}",
            describe(value)
        )));
    };

    let mut entries = map.iter();
    let (Some((key, body)), None) = (entries.next(), entries.next()) else {
        return Err(PipelineError::Composition(format!(
            "{at}: an entry must have exactly one key ('node', 'seq' or 'parallel'), found {}",
            map.len()
        )));
    };

    match key.as_str() {
        Some("node") => Ok(Step::from(build_node(body, at)?)),
        Some("seq") => {
            let steps = build_children(body, &format!("{at}.seq"))?;
            Ok(Step::from(Pipeline::seq(steps)))
        }
        Some("parallel") => build_parallel(body, &format!("{at}.parallel")),
        _ => Err(PipelineError::Composition(format!(
            "{at}: unknown entry {}, expected 'node', 'seq' or 'parallel'",
            describe(key)
        ))),
    }
}

fn build_children(value: &Value, at: &str) -> Result<Vec<Step>, PipelineError> {
    let Value::Sequence(items) = value else {
        return Err(PipelineError::Composition(format!(
            "{at}: expected a list of entries, found {}",
            describe(value)
        )));
    };

    items
        .iter()
        .enumerate()
        .map(|(i, item)| build_step(item, &format!("{at}[{i}]")))
        .collect()
}

/// `parallel` accepts a bare list or `{ name, steps }`.
fn build_parallel(value: &Value, at: &str) -> Result<Step, PipelineError> {
    let pipeline = match value {
        Value::Mapping(map) => {
            let steps = map.get("steps").ok_or_else(|| {
                PipelineError::Composition(format!("{at}: missing 'steps'"))
            })?;
            let steps = build_children(steps, &format!("{at}.steps"))?;
            match map.get("name") {
                Some(Value::String(name)) => Pipeline::parallel_named(name.as_str(), steps)?,
                Some(other) => {
                    return Err(PipelineError::Composition(format!(
                        "{at}.name: expected a string, found {}",
                        describe(other)
                    )));
                }
                None => Pipeline::parallel(steps)?,
            }
        }
        _ => Pipeline::parallel(build_children(value, at)?)?,
    };
    Ok(Step::from(pipeline))
}

fn build_node(value: &Value, at: &str) -> Result<Node, PipelineError> {
    let Value::Mapping(map) = value else {
        return Err(PipelineError::Composition(format!(
            "{at}.node: expected a mapping, found {}",
            describe(value)
        )));
    };

    let name = required_str(map, "name", at)?;
    let kind_name = required_str(map, "type", at)?;
    let inputs = path_map(map, "inputs", at)?;
    let outputs = path_map(map, "outputs", at)?;

    let mut rest = Mapping::new();
    for (key, val) in map {
        match key.as_str() {
            Some("name" | "inputs" | "outputs") => {}
            _ => {
                rest.insert(key.clone(), val.clone());
            }
        }
    }

    let kind = if BUILTIN_KINDS.contains(&kind_name) {
        serde_yaml_ng::from_value::<NodeKind>(Value::Mapping(rest))
            .map_err(|e| PipelineError::ParseError(format!("{at}.node '{name}': {e}")))?
    } else {
        rest.remove("type");
        let params = serde_json::to_value(Value::Mapping(rest))
            .map_err(|e| PipelineError::ParseError(format!("{at}.node '{name}': {e}")))?;
        NodeKind::Custom {
            kind: kind_name.to_string(),
            params,
        }
    };

    let mut node = Node::new(name, kind)?;
    for (key, paths) in inputs {
        node = node.with_input(key, paths)?;
    }
    for (key, paths) in outputs {
        node = node.with_output(key, paths)?;
    }
    Ok(node)
}

fn required_str<'a>(map: &'a Mapping, key: &str, at: &str) -> Result<&'a str, PipelineError> {
    map.get(key).and_then(Value::as_str).ok_or_else(|| {
        PipelineError::Composition(format!("{at}.node: missing string field '{key}'"))
    })
}

fn path_map(map: &Mapping, key: &str, at: &str) -> Result<PathMap, PipelineError> {
    match map.get(key) {
        None => Ok(PathMap::new()),
        Some(value) => serde_yaml_ng::from_value(value.clone())
            .map_err(|e| PipelineError::ParseError(format!("{at}.node.{key}: {e}"))),
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => format!("boolean {b}"),
        Value::Number(n) => format!("number {n}"),
        Value::String(s) => format!("'{s}'"),
        Value::Sequence(_) => "a list".to_string(),
        Value::Mapping(_) => "a mapping".to_string(),
        Value::Tagged(tagged) => format!("tagged value {}", tagged.tag),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::compose::PipelineKind;

    const IMAGING_PIPELINE: &str = r#"
seq:
  - node:
      name: index_images
      type: shell
      command: "index-images --plate plate1"
      outputs:
        index: [/data/plate1/index.csv]
  - parallel:
      name: channels
      steps:
        - node:
            name: segment
            type: par_container
            template:
              image: "cellprofiler/cellprofiler:4.2.6"
              command: [cellprofiler, -c, -r]
            units:
              - inputs: { image: [/data/plate1/A01.tif] }
                outputs: { mask: [/data/plate1/A01_mask.png] }
              - inputs: { image: [/data/plate1/A02.tif] }
                outputs: { mask: [/data/plate1/A02_mask.png] }
        - seq:
            - node: { name: stitch, type: container, image: "fiji:latest", command: [fiji, --headless] }
            - node: { name: summarize, type: pure_function, function: "imaging.stats.summarize" }
  - node: { name: publish, type: shell, command: "publish.sh" }
"#;

    #[test]
    fn test_parse_imaging_pipeline() {
        let pipeline = parse_pipeline_yaml(IMAGING_PIPELINE).unwrap();
        assert_eq!(pipeline.kind(), PipelineKind::Seq);
        assert_eq!(pipeline.node_list().len(), 3);

        let graph = pipeline.compile().unwrap();
        // index, scatter, segment, stitch, summarize, gather, publish
        assert_eq!(graph.node_count(), 7);

        let leaves = pipeline.leaves();
        let names: Vec<&str> = leaves.iter().map(|n| n.name()).collect();
        assert_eq!(
            names,
            vec![
                "index_images",
                "channels_scatter",
                "segment",
                "stitch",
                "summarize",
                "channels_gather",
                "publish"
            ]
        );
        assert_eq!(leaves[0].output_paths()["index"], vec!["/data/plate1/index.csv"]);
        assert_eq!(leaves[2].input_paths()["image"].len(), 2);
    }

    #[test]
    fn test_unknown_node_type_becomes_custom() {
        let yaml = r#"
seq:
  - node: { name: napari_view, type: napari, layers: 3 }
"#;
        let pipeline = parse_pipeline_yaml(yaml).unwrap();
        let leaves = pipeline.leaves();
        match leaves[0].kind() {
            NodeKind::Custom { kind, params } => {
                assert_eq!(kind, "napari");
                assert_eq!(params["layers"], 3);
            }
            other => panic!("expected custom kind, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_entry_is_composition_error() {
        let yaml = r#"
seq:
  - node: { name: a, type: shell, command: "true" }
  - loop: [1, 2]
"#;
        let err = parse_pipeline_yaml(yaml).unwrap_err();
        assert!(matches!(err, PipelineError::Composition(_)), "got: {err}");
        assert!(err.to_string().contains("$.seq[1]"), "got: {err}");
    }

    #[test]
    fn test_scalar_entry_is_composition_error() {
        let err = parse_pipeline_yaml("seq: [just-a-string]").unwrap_err();
        assert!(matches!(err, PipelineError::Composition(_)), "got: {err}");
    }

    #[test]
    fn test_entry_with_two_keys_is_composition_error() {
        let yaml = r#"
seq:
  - node: { name: a, type: shell, command: "true" }
    seq: []
"#;
        let err = parse_pipeline_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("exactly one key"), "got: {err}");
    }

    #[test]
    fn test_top_level_node_rejected() {
        let err = parse_pipeline_yaml("node: { name: a, type: shell, command: 'true' }").unwrap_err();
        assert!(err.to_string().contains("top-level"), "got: {err}");
    }

    #[test]
    fn test_missing_node_name() {
        let err = parse_pipeline_yaml("seq: [{ node: { type: shell, command: 'x' } }]").unwrap_err();
        assert!(err.to_string().contains("'name'"), "got: {err}");
    }

    #[test]
    fn test_marker_with_paths_rejected() {
        let yaml = "seq: [{ node: { name: s, type: scatter, inputs: { x: [a] } } }]";
        let err = parse_pipeline_yaml(yaml).unwrap_err();
        assert!(matches!(err, PipelineError::Node(_)), "got: {err}");
    }

    #[test]
    fn test_invalid_yaml() {
        let err = parse_pipeline_yaml("seq: [unclosed").unwrap_err();
        assert!(matches!(err, PipelineError::ParseError(_)));
    }

    #[test]
    fn test_unnamed_parallel_list_form() {
        let yaml = r#"
parallel:
  - node: { name: a, type: shell, command: "true" }
  - node: { name: b, type: shell, command: "true" }
"#;
        let pipeline = parse_pipeline_yaml(yaml).unwrap();
        assert_eq!(pipeline.kind(), PipelineKind::Parallel);
        assert_eq!(pipeline.compile().unwrap().edge_count(), 4);
    }

    #[test]
    fn test_load_pipeline_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("pipeline.yaml");
        std::fs::write(&path, IMAGING_PIPELINE).unwrap();

        let pipeline = load_pipeline_file(&path).unwrap();
        assert_eq!(pipeline.leaves().len(), 7);

        let err = load_pipeline_file(&tmp.path().join("missing.yaml")).unwrap_err();
        assert!(matches!(err, PipelineError::IoError(_)));
    }
}
