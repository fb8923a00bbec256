//! Output locations and remote mounts.
//!
//! An output directory is either a local path or a remote object-store URI
//! (`gs://bucket/prefix`, `s3://bucket/prefix`). Remote locations are bridged
//! to a local mount point for the duration of a run. The mount helpers are
//! external processes and are awaited, never run on a runtime worker.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::process::Command;
use tokio::sync::OwnedMutexGuard;

use super::BackendError;

// ---------------------------------------------------------------------------
// Locations
// ---------------------------------------------------------------------------

/// Where a backend writes its workflow file and runs the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Local(PathBuf),
    Remote(RemoteLocation),
}

/// A remote object-store directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLocation {
    scheme: String,
    bucket: String,
    prefix: String,
}

impl Location {
    /// Parse a local path, `file://` URL or remote `<scheme>://<bucket>[/prefix]` URI.
    pub fn parse(raw: &str) -> Result<Self, BackendError> {
        let Some((scheme, rest)) = raw.split_once("://") else {
            if raw.is_empty() {
                return Err(BackendError::InvalidLocation("empty output directory".to_string()));
            }
            return Ok(Location::Local(PathBuf::from(raw)));
        };

        if scheme == "file" {
            return Ok(Location::Local(PathBuf::from(rest)));
        }
        if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(BackendError::InvalidLocation(format!("invalid scheme in '{raw}'")));
        }

        let rest = rest.trim_matches('/');
        let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(BackendError::InvalidLocation(format!("missing bucket in '{raw}'")));
        }

        Ok(Location::Remote(RemoteLocation {
            scheme: scheme.to_ascii_lowercase(),
            bucket: bucket.to_string(),
            prefix: prefix.trim_matches('/').to_string(),
        }))
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Location::Remote(_))
    }
}

impl RemoteLocation {
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Path inside the bucket, without leading or trailing slashes. May be empty.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Normalized URI without a trailing slash.
    pub fn uri(&self) -> String {
        if self.prefix.is_empty() {
            format!("{}://{}", self.scheme, self.bucket)
        } else {
            format!("{}://{}/{}", self.scheme, self.bucket, self.prefix)
        }
    }

    /// Rewrite `path` to live under `mount_point` when it points inside this
    /// location. Other paths are returned unchanged.
    pub fn localize(&self, path: &str, mount_point: &Path) -> String {
        let uri = self.uri();
        let Some(rest) = path.strip_prefix(&uri) else {
            return path.to_string();
        };
        if rest.is_empty() {
            return mount_point.display().to_string();
        }
        match rest.strip_prefix('/') {
            Some(relative) => mount_point.join(relative).display().to_string(),
            // `gs://bucket/data2` is not inside `gs://bucket/data`
            None => path.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Mounter
// ---------------------------------------------------------------------------

/// Bridges a remote location to a local directory.
///
/// Uses RPITIT for the async methods, like `Backend`.
pub trait Mounter: Send + Sync + 'static {
    fn mount(
        &self,
        remote: &RemoteLocation,
        mount_point: &Path,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    fn unmount(&self, mount_point: &Path) -> impl Future<Output = Result<(), BackendError>> + Send;
}

/// FUSE-based mounter: `gcsfuse` for `gs://`, `s3fs` for `s3://`,
/// `fusermount -u` to unmount.
#[derive(Debug, Clone, Copy, Default)]
pub struct FuseMounter;

impl FuseMounter {
    fn mount_command(remote: &RemoteLocation, mount_point: &Path) -> Result<Command, BackendError> {
        let mut cmd = match remote.scheme() {
            "gs" => {
                let mut cmd = Command::new("gcsfuse");
                cmd.arg("--implicit-dirs");
                if !remote.prefix().is_empty() {
                    cmd.arg("--only-dir").arg(remote.prefix());
                }
                cmd.arg(remote.bucket());
                cmd
            }
            "s3" => {
                let mut cmd = Command::new("s3fs");
                if remote.prefix().is_empty() {
                    cmd.arg(remote.bucket());
                } else {
                    cmd.arg(format!("{}:/{}", remote.bucket(), remote.prefix()));
                }
                cmd
            }
            other => {
                return Err(BackendError::Mount(format!(
                    "no mount helper for scheme '{other}'"
                )));
            }
        };
        cmd.arg(mount_point);
        Ok(cmd)
    }

    fn unmount_command(mount_point: &Path) -> Command {
        let mut cmd = Command::new("fusermount");
        cmd.arg("-u").arg(mount_point);
        cmd
    }
}

impl Mounter for FuseMounter {
    async fn mount(&self, remote: &RemoteLocation, mount_point: &Path) -> Result<(), BackendError> {
        let mut cmd = Self::mount_command(remote, mount_point)?;
        run_helper(&mut cmd, "mount").await
    }

    async fn unmount(&self, mount_point: &Path) -> Result<(), BackendError> {
        run_helper(&mut Self::unmount_command(mount_point), "unmount").await
    }
}

async fn run_helper(cmd: &mut Command, action: &str) -> Result<(), BackendError> {
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    let output = cmd
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(|e| BackendError::Mount(format!("failed to {action} with '{program}': {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(BackendError::Mount(format!(
            "'{program}' exited with status {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// MountGuard
// ---------------------------------------------------------------------------

/// A mounted remote location.
///
/// Unmount with `release()`. A guard dropped while still mounted schedules
/// the unmount on the current runtime. An optional lease is held until the
/// unmount has finished, so the next run cannot mount the same directory
/// early.
pub struct MountGuard<M: Mounter> {
    mounter: Arc<M>,
    mount_point: PathBuf,
    mounted: bool,
    lease: Option<OwnedMutexGuard<()>>,
}

impl<M: Mounter> MountGuard<M> {
    /// Create the mount point if needed and mount `remote` onto it.
    pub async fn acquire(
        mounter: Arc<M>,
        remote: &RemoteLocation,
        mount_point: &Path,
    ) -> Result<Self, BackendError> {
        tokio::fs::create_dir_all(mount_point).await?;
        mounter.mount(remote, mount_point).await?;
        tracing::info!(
            remote = %remote.uri(),
            mount_point = %mount_point.display(),
            "mounted remote output directory"
        );
        Ok(Self {
            mounter,
            mount_point: mount_point.to_path_buf(),
            mounted: true,
            lease: None,
        })
    }

    /// Keep `lease` locked until this mount is released.
    pub(crate) fn with_lease(mut self, lease: OwnedMutexGuard<()>) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Unmount now and report the result.
    pub async fn release(mut self) -> Result<(), BackendError> {
        self.mounted = false;
        self.mounter.unmount(&self.mount_point).await?;
        tracing::debug!(mount_point = %self.mount_point.display(), "unmounted");
        Ok(())
    }
}

impl<M: Mounter> Drop for MountGuard<M> {
    fn drop(&mut self) {
        if !self.mounted {
            return;
        }
        let mounter = Arc::clone(&self.mounter);
        let mount_point = self.mount_point.clone();
        let lease = self.lease.take();

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = mounter.unmount(&mount_point).await {
                        tracing::warn!(
                            mount_point = %mount_point.display(),
                            error = %e,
                            "failed to unmount"
                        );
                    }
                    drop(lease);
                });
            }
            Err(_) => tracing::warn!(
                mount_point = %mount_point.display(),
                "no async runtime to unmount on, mount left in place"
            ),
        }
    }
}

impl<M: Mounter> std::fmt::Debug for MountGuard<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountGuard")
            .field("mount_point", &self.mount_point)
            .field("mounted", &self.mounted)
            .field("leased", &self.lease.is_some())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    /// Records mount/unmount calls in order; never touches the system.
    #[derive(Debug, Default)]
    pub struct RecordingMounter {
        pub events: Mutex<Vec<String>>,
        pub fail_mount: bool,
    }

    impl RecordingMounter {
        pub fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        /// Poll until `count` events are recorded or a few seconds pass.
        pub async fn wait_for_events(&self, count: usize) -> Vec<String> {
            for _ in 0..200 {
                if self.events.lock().unwrap().len() >= count {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            self.events()
        }
    }

    impl Mounter for RecordingMounter {
        async fn mount(&self, remote: &RemoteLocation, mount_point: &Path) -> Result<(), BackendError> {
            if self.fail_mount {
                return Err(BackendError::Mount("bucket unreachable".to_string()));
            }
            tokio::fs::write(mount_point.join(".mounted"), remote.uri()).await?;
            self.events
                .lock()
                .unwrap()
                .push(format!("mount {} {}", remote.uri(), mount_point.display()));
            Ok(())
        }

        async fn unmount(&self, mount_point: &Path) -> Result<(), BackendError> {
            self.events
                .lock()
                .unwrap()
                .push(format!("unmount {}", mount_point.display()));
            Ok(())
        }
    }
}
