//! Pipeline composition and compilation.
//!
//! - `compose` -- `Seq` / `Parallel` composites and their `compile()`
//! - `resolve` -- construction-time resolved lists and flattening
//! - `graph` -- the compiled dependency graph (petgraph, keyed by node identity)
//! - `definition` -- YAML pipeline definitions and the pipeline error type

pub mod compose;
pub mod definition;
pub mod graph;
pub mod resolve;

pub use compose::{Pipeline, PipelineKind, Step};
pub use definition::{load_pipeline_file, parse_pipeline_yaml, PipelineError};
pub use graph::PipelineGraph;
