//! Pipeline compilation and dispatch for multiact.
//!
//! Builds `Seq`/`Parallel` pipeline trees, compiles them into dependency
//! graphs, lowers the graphs into workflow files for an external runner and
//! supervises the runner process.

pub mod backend;
pub mod config;
pub mod pipeline;
