//! Runner process supervision.
//!
//! `RunHandle` tracks one launched runner process: its pid (which is also its
//! process group id), its log file and its lifecycle state. A supervisor task
//! owns the child and any remote mount: it reaps the runner and only then
//! unmounts, so dropping the handle never pulls the output directory out from
//! under a live runner. Exit is observed only through `wait()` or
//! `try_wait()`; `terminate()` and `kill()` signal the whole process group
//! and return immediately.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use multiact_types::run::{RunRecord, RunState};
use tokio::process::Child;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::mount::{MountGuard, Mounter};
use super::BackendError;

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// Stop requests a handle can send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    /// Graceful stop (SIGTERM); the runner may clean up.
    Terminate,
    /// Forceful stop (SIGKILL); cannot be caught.
    Kill,
}

/// Delivers signals to a process group.
pub trait SignalSender: Send + Sync {
    fn send(&self, pgid: u32, signal: ProcessSignal) -> Result<(), BackendError>;
}

/// Sends real signals with `killpg(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NixSignaller;

impl SignalSender for NixSignaller {
    #[cfg(unix)]
    fn send(&self, pgid: u32, signal: ProcessSignal) -> Result<(), BackendError> {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let raw = i32::try_from(pgid)
            .map_err(|_| BackendError::Signal(format!("invalid process group id {pgid}")))?;
        let sig = match signal {
            ProcessSignal::Terminate => Signal::SIGTERM,
            ProcessSignal::Kill => Signal::SIGKILL,
        };

        match killpg(Pid::from_raw(raw), sig) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => {
                tracing::debug!(pgid, ?signal, "process group already gone");
                Ok(())
            }
            Err(e) => Err(BackendError::Signal(format!("{sig:?} to group {pgid}: {e}"))),
        }
    }

    #[cfg(not(unix))]
    fn send(&self, _pgid: u32, _signal: ProcessSignal) -> Result<(), BackendError> {
        Err(BackendError::Signal(
            "process group signals are not supported on this platform".to_string(),
        ))
    }
}

// ---------------------------------------------------------------------------
// RunHandle
// ---------------------------------------------------------------------------

/// A launched runner process.
///
/// Must be created inside a tokio runtime. Dropping the handle detaches from
/// the runner; its supervisor still reaps it and releases its mount.
pub struct RunHandle {
    run_id: Uuid,
    pid: u32,
    log_path: PathBuf,
    started_at: DateTime<Utc>,
    state: RunState,
    /// Set by the supervisor as soon as the runner is reaped.
    exit: watch::Receiver<Option<RunState>>,
    /// Finishes after the exit is recorded and the mount released.
    supervisor: Option<JoinHandle<()>>,
    signaller: Arc<dyn SignalSender>,
}

impl RunHandle {
    /// Supervise a runner that has no remote mount.
    #[cfg(test)]
    pub(crate) fn new(
        child: Child,
        log_path: PathBuf,
        signaller: Arc<dyn SignalSender>,
    ) -> Result<Self, BackendError> {
        Self::start(child, log_path, signaller, None::<MountGuard<super::mount::FuseMounter>>)
    }

    /// Supervise a runner, releasing `mount` once the runner has exited.
    pub(crate) fn start<M: Mounter>(
        child: Child,
        log_path: PathBuf,
        signaller: Arc<dyn SignalSender>,
        mount: Option<MountGuard<M>>,
    ) -> Result<Self, BackendError> {
        let pid = child
            .id()
            .ok_or_else(|| BackendError::Launch("runner exited before its pid was read".to_string()))?;
        let run_id = Uuid::now_v7();
        let (exit_tx, exit_rx) = watch::channel(None);
        let supervisor = tokio::spawn(supervise(run_id, pid, child, mount, exit_tx));

        let handle = Self {
            run_id,
            pid,
            log_path,
            started_at: Utc::now(),
            state: RunState::Started,
            exit: exit_rx,
            supervisor: Some(supervisor),
            signaller,
        };
        tracing::info!(
            run_id = %handle.run_id,
            pid,
            log = %handle.log_path.display(),
            "runner started"
        );
        Ok(handle)
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Snapshot for the record-keeping service.
    pub fn record(&self) -> RunRecord {
        RunRecord {
            run_id: self.run_id,
            pid: self.pid,
            log_path: self.log_path.clone(),
            started_at: self.started_at,
            state: self.state,
        }
    }

    /// Wait for the runner to exit and its mount, if any, to be released.
    pub async fn wait(&mut self) -> Result<RunState, BackendError> {
        if let Some(supervisor) = self.supervisor.as_mut() {
            supervisor
                .await
                .map_err(|e| BackendError::Supervision(e.to_string()))?;
            self.supervisor = None;
        }
        self.observe_exit()
    }

    /// Poll for exit without blocking. `None` while the runner is still going
    /// or its mount is still being released.
    pub fn try_wait(&mut self) -> Result<Option<RunState>, BackendError> {
        if self.supervisor.as_ref().is_some_and(|s| !s.is_finished()) {
            return Ok(None);
        }
        self.supervisor = None;
        self.observe_exit().map(Some)
    }

    /// Everything the runner has written so far. The file may still be
    /// growing; invalid UTF-8 from a partial write is replaced, not an error.
    pub async fn get_log(&self) -> Result<String, BackendError> {
        match tokio::fs::read(&self.log_path).await {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Print the log to stdout.
    pub async fn print_log(&self) -> Result<(), BackendError> {
        let log = self.get_log().await?;
        print!("{log}");
        Ok(())
    }

    /// Ask the runner's process group to stop (SIGTERM).
    pub fn terminate(&self) -> Result<(), BackendError> {
        self.signal(ProcessSignal::Terminate)
    }

    /// Force the runner's process group to stop (SIGKILL).
    pub fn kill(&self) -> Result<(), BackendError> {
        self.signal(ProcessSignal::Kill)
    }

    /// Once the runner is reaped its pid may belong to someone else, so
    /// nothing is sent.
    fn signal(&self, signal: ProcessSignal) -> Result<(), BackendError> {
        if self.exit.borrow().is_some() {
            tracing::debug!(run_id = %self.run_id, pid = self.pid, ?signal, "runner already exited, not signalling");
            return Ok(());
        }
        tracing::info!(run_id = %self.run_id, pid = self.pid, ?signal, "signalling runner");
        self.signaller.send(self.pid, signal)
    }

    fn observe_exit(&mut self) -> Result<RunState, BackendError> {
        let Some(state) = *self.exit.borrow() else {
            return Err(BackendError::Supervision(
                "supervisor stopped without recording an exit".to_string(),
            ));
        };
        self.state = state;
        Ok(state)
    }
}

/// Reap the runner, publish its exit, then release its mount.
async fn supervise<M: Mounter>(
    run_id: Uuid,
    pid: u32,
    mut child: Child,
    mount: Option<MountGuard<M>>,
    exit: watch::Sender<Option<RunState>>,
) {
    let state = match child.wait().await {
        Ok(status) => {
            tracing::info!(%run_id, pid, %status, "runner exited");
            RunState::Exited {
                code: status.code(),
            }
        }
        Err(e) => {
            tracing::warn!(%run_id, pid, error = %e, "failed to wait for runner");
            RunState::Exited { code: None }
        }
    };
    exit.send_replace(Some(state));

    if let Some(guard) = mount {
        if let Err(e) = guard.release().await {
            tracing::warn!(%run_id, error = %e, "failed to unmount after run");
        }
    }
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("run_id", &self.run_id)
            .field("pid", &self.pid)
            .field("log_path", &self.log_path)
            .field("state", &self.state)
            .field("supervised", &self.supervisor.is_some())
            .finish()
    }
}


#[cfg(all(test, unix))]
mod tests {
    use std::process::Stdio;

    use super::testing::RecordingSignaller;
    use super::*;

    fn spawn(script: &str, log_path: &Path) -> Child {
        let log = std::fs::File::create(log_path).unwrap();
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone().unwrap()))
            .stderr(Stdio::from(log))
            .process_group(0);
        cmd.spawn().unwrap()
    }

    #[tokio::test]
    async fn wait_records_exit_code() {
        let tmp = tempfile::TempDir::new().unwrap();
        let log_path = tmp.path().join("run.log");
        let child = spawn("echo segmenting; exit 3", &log_path);
        let mut handle =
            RunHandle::new(child, log_path, Arc::new(RecordingSignaller::default())).unwrap();

        assert_eq!(handle.state(), RunState::Started);
        let state = handle.wait().await.unwrap();
        assert_eq!(state, RunState::Exited { code: Some(3) });
        assert_eq!(handle.record().state, state);
        assert!(handle.get_log().await.unwrap().contains("segmenting"));

        // Waiting again returns the recorded state.
        assert_eq!(handle.wait().await.unwrap(), state);
    }

    #[tokio::test]
    async fn terminate_and_kill_send_distinct_signals() {
        let tmp = tempfile::TempDir::new().unwrap();
        let log_path = tmp.path().join("run.log");
        let child = spawn("sleep 30", &log_path);
        let signaller = Arc::new(RecordingSignaller::default());
        let mut handle = RunHandle::new(child, log_path, signaller.clone()).unwrap();
        let pid = handle.pid();

        handle.terminate().unwrap();
        handle.kill().unwrap();

        let sent = signaller.sent();
        assert_eq!(sent, vec![(pid, ProcessSignal::Terminate), (pid, ProcessSignal::Kill)]);
        assert_ne!(sent[0].1, sent[1].1);
        // Signals alone never mark the run as exited.
        assert_eq!(handle.state(), RunState::Started);

        NixSignaller.send(pid, ProcessSignal::Kill).unwrap();
        handle.wait().await.unwrap();
    }

    #[tokio::test]
    async fn signals_after_exit_are_not_sent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let log_path = tmp.path().join("run.log");
        let child = spawn("exit 0", &log_path);
        let signaller = Arc::new(RecordingSignaller::default());
        let mut handle = RunHandle::new(child, log_path, signaller.clone()).unwrap();

        handle.wait().await.unwrap();
        handle.terminate().unwrap();
        handle.kill().unwrap();

        assert!(signaller.sent().is_empty());
    }

    #[tokio::test]
    async fn real_terminate_stops_process_group() {
        let tmp = tempfile::TempDir::new().unwrap();
        let log_path = tmp.path().join("run.log");
        let child = spawn("sleep 30", &log_path);
        let mut handle = RunHandle::new(child, log_path, Arc::new(NixSignaller)).unwrap();

        handle.terminate().unwrap();
        let state = handle.wait().await.unwrap();
        assert_eq!(state, RunState::Exited { code: None });
    }

    #[tokio::test]
    async fn real_kill_stops_process_group() {
        let tmp = tempfile::TempDir::new().unwrap();
        let log_path = tmp.path().join("run.log");
        let child = spawn("trap '' TERM; sleep 30", &log_path);
        let mut handle = RunHandle::new(child, log_path, Arc::new(NixSignaller)).unwrap();

        handle.kill().unwrap();
        let state = handle.wait().await.unwrap();
        assert!(!state.succeeded());
    }

    #[tokio::test]
    async fn try_wait_polls_until_exit() {
        let tmp = tempfile::TempDir::new().unwrap();
        let log_path = tmp.path().join("run.log");
        let child = spawn("sleep 0.5", &log_path);
        let mut handle =
            RunHandle::new(child, log_path, Arc::new(RecordingSignaller::default())).unwrap();

        assert_eq!(handle.try_wait().unwrap(), None);
        handle.wait().await.unwrap();
        assert_eq!(handle.try_wait().unwrap(), Some(RunState::Exited { code: Some(0) }));
    }

    #[tokio::test]
    async fn get_log_missing_file_is_empty() {
        let tmp = tempfile::TempDir::new().unwrap();
        let log_path = tmp.path().join("run.log");
        let child = spawn("exit 0", &log_path);
        let mut handle = RunHandle::new(
            child,
            tmp.path().join("elsewhere.log"),
            Arc::new(RecordingSignaller::default()),
        )
        .unwrap();

        assert_eq!(handle.get_log().await.unwrap(), "");
        handle.wait().await.unwrap();
    }
}
