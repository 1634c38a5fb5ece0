//! Hypervisor configuration.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use cellbox_device::config::normalize_block_driver;

use crate::error::{HypervisorError, Result};

/// Default number of boot vCPUs.
pub const DEFAULT_VCPUS: u32 = 1;
/// Default guest memory in MiB.
pub const DEFAULT_MEMORY_MB: u32 = 2048;

/// Which hypervisor backend drives the sandbox VM.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HypervisorType {
    /// QEMU/KVM.
    #[default]
    Qemu,
    /// Cloud Hypervisor.
    CloudHypervisor,
    /// Firecracker.
    Firecracker,
    /// In-process mock, tests only.
    Mock,
}

impl HypervisorType {
    /// Parses a configured backend name. Unknown names fall back to the
    /// default backend rather than failing sandbox creation.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "cloud-hypervisor" | "clh" => Self::CloudHypervisor,
            "firecracker" | "fc" => Self::Firecracker,
            "mock" => Self::Mock,
            _ => Self::default(),
        }
    }

    /// Stable name of the backend.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Qemu => "qemu",
            Self::CloudHypervisor => "cloud-hypervisor",
            Self::Firecracker => "firecracker",
            Self::Mock => "mock",
        }
    }
}

impl fmt::Display for HypervisorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Boot-time and resource-ceiling configuration of the sandbox VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HypervisorConfig {
    /// Backend selection.
    pub hypervisor_type: HypervisorType,
    /// Guest kernel image.
    pub kernel_path: PathBuf,
    /// Guest rootfs disk image. Exactly one of image and initrd must be set.
    pub image_path: Option<PathBuf>,
    /// Guest initrd. Exactly one of image and initrd must be set.
    pub initrd_path: Option<PathBuf>,
    /// Extra kernel command line parameters.
    pub kernel_params: String,
    /// vCPUs present at boot.
    pub num_vcpus: u32,
    /// Hotplug ceiling for vCPUs. Zero means no ceiling.
    pub default_max_vcpus: u32,
    /// Guest memory at boot, MiB.
    pub memory_mb: u32,
    /// Hotplug ceiling for memory, MiB. Zero means no ceiling.
    pub default_max_memory_mb: u32,
    /// Block driver used for hotplugged drives.
    pub block_device_driver: String,
    /// Whether block devices come from a vhost-user store.
    pub vhost_user_store_enabled: bool,
    /// Root of the vhost-user device store.
    pub vhost_user_store_path: PathBuf,
    /// Whether the guest runs with swap enabled. Pod swap drives are only
    /// sized and hotplugged when set.
    pub guest_swap: bool,
    /// Expose and tail a guest debug console.
    pub enable_debug_console: bool,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            hypervisor_type: HypervisorType::default(),
            kernel_path: PathBuf::new(),
            image_path: None,
            initrd_path: None,
            kernel_params: String::new(),
            num_vcpus: DEFAULT_VCPUS,
            default_max_vcpus: 0,
            memory_mb: DEFAULT_MEMORY_MB,
            default_max_memory_mb: 0,
            block_device_driver: cellbox_device::config::VIRTIO_SCSI.to_string(),
            vhost_user_store_enabled: false,
            vhost_user_store_path: PathBuf::from("/var/run/cellbox/vhost-user"),
            guest_swap: false,
            enable_debug_console: false,
        }
    }
}

impl HypervisorConfig {
    /// Validates boot assets and resource settings, normalizing the block
    /// driver in place.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` when the kernel is missing, when both or
    /// neither of image/initrd are set, or when a resource count is zero.
    pub fn validate(&mut self) -> Result<()> {
        if self.kernel_path.as_os_str().is_empty() {
            return Err(HypervisorError::InvalidConfig(
                "guest kernel path is empty".into(),
            ));
        }
        match (&self.image_path, &self.initrd_path) {
            (Some(_), Some(_)) => {
                return Err(HypervisorError::InvalidConfig(
                    "image and initrd are mutually exclusive".into(),
                ))
            }
            (None, None) => {
                return Err(HypervisorError::InvalidConfig(
                    "either an image or an initrd is required".into(),
                ))
            }
            _ => {}
        }
        if self.num_vcpus == 0 {
            return Err(HypervisorError::InvalidConfig(
                "at least one boot vCPU is required".into(),
            ));
        }
        if self.memory_mb == 0 {
            return Err(HypervisorError::InvalidConfig(
                "guest memory must be non-zero".into(),
            ));
        }
        self.block_device_driver = normalize_block_driver(&self.block_device_driver);
        Ok(())
    }
}
