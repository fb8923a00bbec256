//! Run tracking types.
//!
//! A run is one launch of the external workflow runner. The record-keeping
//! service persists `RunRecord`s; it only ever sees the pid, the log path and
//! the exit state, never the pipeline graph.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a launched runner process.
///
/// `Started` covers both "just spawned" and "running": exit is only observed
/// by waiting on or polling the handle, never pushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Started,
    /// `code` is `None` when the process was ended by a signal.
    Exited { code: Option<i32> },
}

impl RunState {
    pub fn is_exited(&self) -> bool {
        matches!(self, RunState::Exited { .. })
    }

    pub fn succeeded(&self) -> bool {
        matches!(self, RunState::Exited { code: Some(0) })
    }
}

/// Snapshot of a run for persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// UUIDv7 assigned at launch.
    pub run_id: Uuid,
    /// OS process id (also the process group id).
    pub pid: u32,
    /// Log file the runner appends to.
    pub log_path: PathBuf,
    /// When the process was spawned.
    pub started_at: DateTime<Utc>,
    pub state: RunState,
}
