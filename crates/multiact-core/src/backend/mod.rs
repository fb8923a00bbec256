//! Workflow backends.
//!
//! A backend lowers a compiled pipeline graph into a workflow description
//! for an external runner, then launches that runner as a supervised
//! child process.

pub mod mount;
pub mod process;
pub mod snakemake;
mod template;

use std::path::PathBuf;

use crate::pipeline::PipelineError;

pub use mount::{FuseMounter, Location, MountGuard, Mounter, RemoteLocation};
pub use process::{NixSignaller, ProcessSignal, RunHandle, SignalSender};
pub use snakemake::{RunnerCommand, SnakemakeBackend};

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

/// Lowers a pipeline to a runner-specific workflow file and launches it.
///
/// Uses RPITIT for the async launch, like the rest of the crate.
pub trait Backend: Send {
    /// Render the workflow file and return its path. May be called repeatedly.
    fn compile(&mut self) -> Result<PathBuf, BackendError>;

    /// Compile if needed, then spawn the runner and return without waiting.
    fn run(&mut self) -> impl std::future::Future<Output = Result<RunHandle, BackendError>> + Send;
}

// ---------------------------------------------------------------------------
// BackendError
// ---------------------------------------------------------------------------

/// Errors from lowering, launching or supervising a pipeline run.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The node's kind has no lowering in this backend.
    #[error("node '{node}' has kind '{kind}', which this backend cannot lower")]
    UnsupportedNodeKind { node: String, kind: String },

    /// A path key cannot be used as a named input or output.
    #[error("node '{node}' uses invalid path key '{key}'")]
    InvalidPathKey { node: String, key: String },

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("invalid output location: {0}")]
    InvalidLocation(String),

    /// The runner could not be started.
    #[error("failed to launch runner: {0}")]
    Launch(String),

    #[error("mount error: {0}")]
    Mount(String),

    /// Another run of this backend still holds the remote mount.
    #[error("mount point {0} is in use by another run")]
    MountInUse(String),

    /// The task watching the runner failed.
    #[error("runner supervision failed: {0}")]
    Supervision(String),

    #[error("signal error: {0}")]
    Signal(String),
}
