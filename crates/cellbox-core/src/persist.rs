//! Sandbox persistence: JSON state records under a per-sandbox directory,
//! guarded by an advisory file lock for cross-process exclusion.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;

use async_trait::async_trait;
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use tracing::debug;

use cellbox_device::{BlockDrive, DeviceState};

use crate::config::{ContainerConfig, SandboxConfig};
use crate::container::Process;
use crate::error::{CoreError, Result};
use crate::state::{ContainerState, SandboxStateInfo};

const STATE_FILE: &str = "persist.json";
const LOCK_FILE: &str = "lock";

/// Default root of sandbox run directories.
pub const DEFAULT_RUN_ROOT: &str = "/run/cellbox/sandboxes";

/// Persisted form of one container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerDiskState {
    /// Container ID.
    pub id: String,
    /// Lifecycle state.
    pub state: ContainerState,
    /// Init process, if started.
    pub process: Option<Process>,
    /// Devices the container references, by manager ID.
    pub device_ids: Vec<String>,
    /// Manager ID of the drive backing a block rootfs, if any.
    pub block_device_id: Option<String>,
    /// Configuration the container was created with.
    pub config: ContainerConfig,
}

/// Persisted form of one sandbox: everything needed to pick the sandbox up
/// again after a runtime restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxDiskState {
    /// Sandbox ID.
    pub sandbox_id: String,
    /// Runtime state.
    pub state: SandboxStateInfo,
    /// Configuration.
    pub config: SandboxConfig,
    /// Device set of the sandbox.
    pub devices: Vec<DeviceState>,
    /// Containers of the sandbox.
    pub containers: Vec<ContainerDiskState>,
    /// Current annotations.
    pub annotations: HashMap<String, String>,
    /// Hotplugged swap drives.
    pub swap_devices: Vec<BlockDrive>,
    /// Total swap handed to the guest so far, bytes.
    pub swap_size_bytes: i64,
}

/// Held lock on a sandbox's on-disk state. Dropping it releases the lock.
pub struct StoreLock {
    _lock: Flock<File>,
}

/// Storage capability for sandbox state.
#[async_trait]
pub trait PersistDriver: Send + Sync {
    /// Writes the full state record, replacing any previous one.
    async fn store(&self, state: &SandboxDiskState) -> Result<()>;

    /// Reads the state record of a sandbox.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the sandbox has no stored state.
    async fn load(&self, sandbox_id: &str) -> Result<SandboxDiskState>;

    /// Removes everything stored for a sandbox. Called last during delete.
    async fn destroy(&self, sandbox_id: &str) -> Result<()>;

    /// Takes the sandbox's advisory file lock without blocking.
    ///
    /// # Errors
    ///
    /// Returns `ResourceBusy` when another process holds a conflicting lock.
    fn lock(&self, sandbox_id: &str, exclusive: bool) -> Result<StoreLock>;

    /// Scratch directory of the sandbox (swap files, sockets).
    fn run_path(&self, sandbox_id: &str) -> PathBuf;
}

/// Filesystem-backed [`PersistDriver`].
pub struct FsDriver {
    base_dir: PathBuf,
}

impl FsDriver {
    /// Driver rooted at `base_dir`, or at [`DEFAULT_RUN_ROOT`] when `None`.
    pub fn new(base_dir: Option<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_RUN_ROOT));
        fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    fn sandbox_dir(&self, sandbox_id: &str) -> PathBuf {
        self.base_dir.join(sandbox_id)
    }

    fn state_path(&self, sandbox_id: &str) -> PathBuf {
        self.sandbox_dir(sandbox_id).join(STATE_FILE)
    }
}

#[async_trait]
impl PersistDriver for FsDriver {
    async fn store(&self, state: &SandboxDiskState) -> Result<()> {
        let dir = self.sandbox_dir(&state.sandbox_id);
        fs::create_dir_all(&dir)?;
        let payload = serde_json::to_vec_pretty(state)?;
        // write-then-rename so a crash never leaves a torn record
        let tmp = dir.join(format!("{STATE_FILE}.tmp"));
        fs::write(&tmp, payload)?;
        fs::rename(&tmp, self.state_path(&state.sandbox_id))?;
        debug!(sandbox = %state.sandbox_id, path = %dir.display(), "state stored");
        Ok(())
    }

    async fn load(&self, sandbox_id: &str) -> Result<SandboxDiskState> {
        let path = self.state_path(sandbox_id);
        let payload = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CoreError::NotFound(format!("sandbox {sandbox_id}"))
            } else {
                CoreError::Io(e)
            }
        })?;
        Ok(serde_json::from_slice(&payload)?)
    }

    async fn destroy(&self, sandbox_id: &str) -> Result<()> {
        let dir = self.sandbox_dir(sandbox_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::Io(e)),
        }
    }

    fn lock(&self, sandbox_id: &str, exclusive: bool) -> Result<StoreLock> {
        let dir = self.sandbox_dir(sandbox_id);
        fs::create_dir_all(&dir)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join(LOCK_FILE))?;
        let arg = if exclusive {
            FlockArg::LockExclusiveNonblock
        } else {
            FlockArg::LockSharedNonblock
        };
        match Flock::lock(file, arg) {
            Ok(lock) => Ok(StoreLock { _lock: lock }),
            Err((_, nix::errno::Errno::EWOULDBLOCK)) => Err(CoreError::ResourceBusy(format!(
                "sandbox {sandbox_id} is locked by another process"
            ))),
            Err((_, errno)) => Err(CoreError::Io(std::io::Error::from(errno))),
        }
    }

    fn run_path(&self, sandbox_id: &str) -> PathBuf {
        self.sandbox_dir(sandbox_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn driver(dir: &TempDir) -> FsDriver {
        FsDriver::new(Some(dir.path().to_path_buf())).unwrap()
    }

    #[tokio::test]
    async fn state_survives_a_round_trip() {
        let dir = TempDir::new().unwrap();
        let fs = driver(&dir);

        let mut state = SandboxDiskState {
            sandbox_id: "sb1".into(),
            ..SandboxDiskState::default()
        };
        state.state.block_index_set.insert(3);
        state.annotations.insert("tier".into(), "gold".into());
        fs.store(&state).await.unwrap();

        let loaded = fs.load("sb1").await.unwrap();
        assert_eq!(loaded.sandbox_id, "sb1");
        assert!(loaded.state.block_index_set.contains(&3));
        assert_eq!(loaded.annotations["tier"], "gold");
    }

    #[tokio::test]
    async fn loading_a_missing_sandbox_is_not_found() {
        let dir = TempDir::new().unwrap();
        let fs = driver(&dir);
        assert!(matches!(
            fs.load("ghost").await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let fs = driver(&dir);
        let state = SandboxDiskState {
            sandbox_id: "sb1".into(),
            ..SandboxDiskState::default()
        };
        fs.store(&state).await.unwrap();
        fs.destroy("sb1").await.unwrap();
        fs.destroy("sb1").await.unwrap();
        assert!(fs.load("sb1").await.is_err());
    }

    #[test]
    fn exclusive_locks_conflict() {
        let dir = TempDir::new().unwrap();
        let fs = driver(&dir);

        let held = fs.lock("sb1", true).unwrap();
        assert!(matches!(
            fs.lock("sb1", true),
            Err(CoreError::ResourceBusy(_))
        ));
        drop(held);
        fs.lock("sb1", true).unwrap();
    }

    #[test]
    fn shared_locks_coexist() {
        let dir = TempDir::new().unwrap();
        let fs = driver(&dir);
        let a = fs.lock("sb1", false).unwrap();
        let b = fs.lock("sb1", false).unwrap();
        drop((a, b));
    }
}
