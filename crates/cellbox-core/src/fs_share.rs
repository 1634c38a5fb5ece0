//! Host/guest filesystem sharing: the per-sandbox share directory and the
//! rootfs storage descriptions handed to the agent.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::fs;
use tracing::debug;

use cellbox_agent::Storage;
use cellbox_device::{Device, DeviceManager};

use crate::config::ContainerConfig;
use crate::error::{CoreError, Result};

/// Guest path prefix containers are unpacked under.
const GUEST_RUN_DIR: &str = "/run/cellbox";

/// Manages the host share directory of one sandbox.
///
/// `prepare` and `cleanup` are both idempotent: preparing twice is fine, and
/// cleaning up an already clean (or never prepared) share succeeds.
pub struct FilesystemShare {
    sandbox_id: String,
    root: PathBuf,
    prepared: AtomicBool,
}

impl FilesystemShare {
    /// Share manager rooted at `root`.
    #[must_use]
    pub fn new(sandbox_id: &str, root: PathBuf) -> Self {
        Self {
            sandbox_id: sandbox_id.to_string(),
            root,
            prepared: AtomicBool::new(false),
        }
    }

    /// Host directory exported to the guest.
    #[must_use]
    pub fn shared_dir(&self) -> PathBuf {
        self.root.join(&self.sandbox_id).join("shared")
    }

    /// Host directory holding per-container mount points.
    #[must_use]
    pub fn mounts_dir(&self) -> PathBuf {
        self.root.join(&self.sandbox_id).join("mounts")
    }

    /// Creates the share directories.
    pub async fn prepare(&self) -> Result<()> {
        if self.prepared.swap(true, Ordering::SeqCst) {
            debug!(sandbox = %self.sandbox_id, "share already prepared");
            return Ok(());
        }
        fs::create_dir_all(self.shared_dir()).await?;
        fs::create_dir_all(self.mounts_dir()).await?;
        Ok(())
    }

    /// Removes the share directories and everything in them.
    pub async fn cleanup(&self) -> Result<()> {
        self.prepared.store(false, Ordering::SeqCst);
        let dir = self.root.join(&self.sandbox_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::Io(e)),
        }
    }

    /// Builds the storage record the guest mounts the container rootfs from.
    ///
    /// A block-backed rootfs references the hotplugged drive by manager ID;
    /// a directory rootfs is exported through the shared directory.
    pub async fn share_rootfs(
        &self,
        container: &ContainerConfig,
        block_device_id: Option<&str>,
        device_manager: &DeviceManager,
    ) -> Result<Storage> {
        let guest_path = format!("{GUEST_RUN_DIR}/{}/rootfs", container.id);
        if let Some(device_id) = block_device_id {
            let device = device_manager
                .get_device(device_id)
                .await
                .ok_or_else(|| CoreError::NotFound(format!("device {device_id}")))?;
            let Device::Block(blk) = device else {
                return Err(CoreError::InvalidConfig(format!(
                    "rootfs device {device_id} is not a block device"
                )));
            };
            let source = blk
                .drive
                .virt_path
                .clone()
                .or_else(|| blk.drive.scsi_addr.clone())
                .ok_or_else(|| {
                    CoreError::InvalidConfig(format!("rootfs drive {device_id} has no guest path"))
                })?;
            return Ok(Storage {
                driver: "blk".to_string(),
                source,
                fstype: if container.rootfs.fstype.is_empty() {
                    "ext4".to_string()
                } else {
                    container.rootfs.fstype.clone()
                },
                options: Vec::new(),
                mount_point: guest_path,
            });
        }

        // directory rootfs: make it visible under the shared dir
        let export = self.shared_dir().join(&container.id);
        fs::create_dir_all(&export).await?;
        Ok(Storage {
            driver: "virtiofs".to_string(),
            source: container.rootfs.source.display().to_string(),
            fstype: "none".to_string(),
            options: vec!["bind".to_string()],
            mount_point: guest_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn prepare_and_cleanup_are_idempotent() {
        let dir = TempDir::new().unwrap();
        let share = FilesystemShare::new("sb1", dir.path().to_path_buf());

        share.prepare().await.unwrap();
        share.prepare().await.unwrap();
        assert!(share.shared_dir().is_dir());
        assert!(share.mounts_dir().is_dir());

        share.cleanup().await.unwrap();
        share.cleanup().await.unwrap();
        assert!(!share.shared_dir().exists());

        // a fresh prepare after cleanup works again
        share.prepare().await.unwrap();
        assert!(share.shared_dir().is_dir());
    }

    #[tokio::test]
    async fn cleanup_leaves_no_residue() {
        let dir = TempDir::new().unwrap();
        let share = FilesystemShare::new("sb1", dir.path().to_path_buf());
        share.prepare().await.unwrap();
        tokio::fs::write(share.shared_dir().join("leftover"), b"x")
            .await
            .unwrap();

        share.cleanup().await.unwrap();
        assert!(!dir.path().join("sb1").exists());
    }

    #[tokio::test]
    async fn directory_rootfs_is_exported_via_virtiofs() {
        let dir = TempDir::new().unwrap();
        let share = FilesystemShare::new("sb1", dir.path().to_path_buf());
        share.prepare().await.unwrap();

        let container = ContainerConfig {
            id: "c1".into(),
            rootfs: crate::config::RootFs {
                source: PathBuf::from("/srv/rootfs/c1"),
                ..crate::config::RootFs::default()
            },
            ..ContainerConfig::default()
        };
        let dm = DeviceManager::new("virtio-scsi", false);
        let storage = share.share_rootfs(&container, None, &dm).await.unwrap();
        assert_eq!(storage.driver, "virtiofs");
        assert_eq!(storage.mount_point, "/run/cellbox/c1/rootfs");
        assert!(share.shared_dir().join("c1").is_dir());
    }
}
