//! Shared domain types for multiact.
//!
//! Nodes, units of work, backend configuration and run records. No IO:
//! only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod node;
pub mod run;
