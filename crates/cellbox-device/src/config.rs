//! Device configuration types shared between the manager, the hypervisor
//! and the sandbox layer.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DeviceError, Result};

// ============================================================================
// Constants
// ============================================================================

/// Block driver backed by virtio-mmio.
pub const VIRTIO_MMIO: &str = "virtio-mmio";
/// Block driver backed by virtio-blk over PCI.
pub const VIRTIO_BLOCK: &str = "virtio-blk";
/// Block driver backed by virtio-blk over CCW.
pub const VIRTIO_BLOCK_CCW: &str = "virtio-blk-ccw";
/// Block driver backed by virtio-scsi.
pub const VIRTIO_SCSI: &str = "virtio-scsi";
/// Block driver backed by an emulated NVDIMM.
pub const NVDIMM: &str = "nvdimm";

/// Device major reserved for vhost-user block devices.
pub const VHOST_USER_BLK_MAJOR: i64 = 241;

/// Highest SCSI address encodable as `id:lun`.
const MAX_SCSI_INDEX: u32 = 65535;

// ============================================================================
// Types
// ============================================================================

/// Kind tag carried by every managed device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceType {
    /// Block device hotplugged as a guest drive.
    Block,
    /// VFIO passthrough device (a whole IOMMU group).
    Vfio,
    /// Device passed through without hypervisor support, bookkeeping only.
    Generic,
    /// vhost-user block backend.
    VhostUserBlk,
    /// vhost-user SCSI backend.
    VhostUserScsi,
    /// vhost-user network backend.
    VhostUserNet,
}

impl DeviceType {
    /// Stable string tag used in persisted state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Vfio => "vfio",
            Self::Generic => "generic",
            Self::VhostUserBlk => "vhost-user-blk",
            Self::VhostUserScsi => "vhost-user-scsi",
            Self::VhostUserNet => "vhost-user-net",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host-side description of a device requested for a container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Path the device appears at inside the container.
    pub container_path: String,
    /// Resolved host path. Left untouched for pmem devices and for callers
    /// that resolved it themselves.
    pub host_path: String,
    /// Device node type, `"b"` (block) or `"c"` (character).
    pub dev_type: String,
    /// Host device major number.
    pub major: i64,
    /// Host device minor number.
    pub minor: i64,
    /// Node permission bits.
    pub file_mode: u32,
    /// Owning uid of the node.
    pub uid: u32,
    /// Owning gid of the node.
    pub gid: u32,
    /// Device backs persistent memory; its host path is authoritative.
    pub pmem: bool,
    /// Attach the device read-only.
    pub read_only: bool,
    /// Manager-assigned identifier.
    pub id: String,
    /// Driver-specific options, e.g. the negotiated block driver.
    pub driver_options: HashMap<String, String>,
}

/// Guest PCI slot path of a hotplugged device, e.g. `"02/03"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciPath(pub String);

impl fmt::Display for PciPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hypervisor-facing description of a block drive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockDrive {
    /// Host file or block node backing the drive.
    pub file: String,
    /// On-disk format, `"raw"` for passthrough nodes.
    pub format: String,
    /// Drive identifier on the hypervisor command line.
    pub id: String,
    /// Sandbox-global drive index.
    pub index: u32,
    /// Guest PCI path, filled in by the hypervisor after hotplug.
    pub pci_path: Option<PciPath>,
    /// SCSI address (`id:lun`) when the block driver is virtio-scsi.
    pub scsi_addr: Option<String>,
    /// Predicted guest device path (`/dev/vdX`) for virtio-blk.
    pub virt_path: Option<String>,
    /// NVDIMM identifier when the drive is exposed as pmem.
    pub nvdimm_id: Option<String>,
    /// Drive backs persistent memory.
    pub pmem: bool,
    /// Attach read-only.
    pub read_only: bool,
    /// Drive is a swap file, guest-visible through the agent only.
    pub swap: bool,
}

/// A single device member of a VFIO IOMMU group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VfioDev {
    /// Hypervisor identifier.
    pub id: String,
    /// PCI bus/device/function, e.g. `"0000:00:1f.2"`.
    pub bdf: String,
    /// Sysfs path of the device.
    pub sysfs_dev: String,
}

/// Attributes of a vhost-user backend socket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VhostUserDeviceAttrs {
    /// Hypervisor identifier.
    pub dev_id: String,
    /// Backend socket path.
    pub socket_path: String,
    /// MAC address, only meaningful for net backends.
    pub mac_address: String,
}

// ============================================================================
// Helpers
// ============================================================================

/// Normalizes a configured block driver name, falling back to virtio-scsi
/// for anything unrecognized.
#[must_use]
pub fn normalize_block_driver(driver: &str) -> String {
    match driver {
        VIRTIO_MMIO | VIRTIO_BLOCK | VIRTIO_BLOCK_CCW | NVDIMM => driver.to_string(),
        _ => VIRTIO_SCSI.to_string(),
    }
}

/// Predicted virtio-blk guest device name for a drive index: `vda`, `vdb`,
/// ..., `vdz`, `vdaa`, and so on.
pub fn virt_drive_name(index: u32) -> Result<String> {
    let mut i = i64::from(index);
    let mut letters = Vec::new();
    loop {
        letters.push(b'a' + u8::try_from(i % 26).unwrap_or(0));
        i = i / 26 - 1;
        if i < 0 {
            break;
        }
    }
    letters.reverse();
    let suffix = String::from_utf8(letters)
        .map_err(|_| DeviceError::InvalidConfig(format!("bad drive index {index}")))?;
    Ok(format!("vd{suffix}"))
}

/// SCSI `id:lun` address for a drive index. 256 LUNs per target.
pub fn scsi_address(index: u32) -> Result<String> {
    if index > MAX_SCSI_INDEX {
        return Err(DeviceError::InvalidConfig(format!(
            "SCSI index {index} exceeds {MAX_SCSI_INDEX}"
        )));
    }
    Ok(format!("{}:{}", index / 256, index % 256))
}

/// Whether a host path names a VFIO group node (`/dev/vfio/<group>`).
#[must_use]
pub fn is_vfio(host_path: &str) -> bool {
    let path = Path::new(host_path);
    path.parent() == Some(Path::new("/dev/vfio"))
        && path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.parse::<u32>().is_ok())
}

/// Whether the description names a block node.
#[must_use]
pub fn is_block(info: &DeviceInfo) -> bool {
    info.dev_type == "b"
}

/// Whether the description names a vhost-user block device. Those carry a
/// reserved major and live under the configured vhost-user store.
#[must_use]
pub fn is_vhost_user_blk(info: &DeviceInfo, store_enabled: bool) -> bool {
    store_enabled && info.dev_type == "b" && info.major == VHOST_USER_BLK_MAJOR
}

/// Resolves the host path for a device from its major/minor via sysfs.
///
/// # Errors
///
/// Fails when the node type is unknown or the sysfs uevent record is missing
/// or malformed.
pub fn sysfs_host_path(info: &DeviceInfo) -> Result<String> {
    let kind = match info.dev_type.as_str() {
        "b" => "block",
        "c" => "char",
        other => {
            return Err(DeviceError::InvalidConfig(format!(
                "unknown device node type {other:?} for {}",
                info.container_path
            )))
        }
    };
    let uevent = format!("/sys/dev/{kind}/{}:{}/uevent", info.major, info.minor);
    let contents = std::fs::read_to_string(&uevent)?;
    for line in contents.lines() {
        if let Some(name) = line.strip_prefix("DEVNAME=") {
            return Ok(format!("/dev/{name}"));
        }
    }
    Err(DeviceError::InvalidConfig(format!(
        "no DEVNAME in {uevent}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drive_names_wrap_past_z() {
        assert_eq!(virt_drive_name(0).unwrap(), "vda");
        assert_eq!(virt_drive_name(25).unwrap(), "vdz");
        assert_eq!(virt_drive_name(26).unwrap(), "vdaa");
        assert_eq!(virt_drive_name(27).unwrap(), "vdab");
    }

    #[test]
    fn scsi_addresses_split_at_256_luns() {
        assert_eq!(scsi_address(0).unwrap(), "0:0");
        assert_eq!(scsi_address(255).unwrap(), "0:255");
        assert_eq!(scsi_address(256).unwrap(), "1:0");
        assert!(scsi_address(65536).is_err());
    }

    #[test]
    fn unknown_block_driver_falls_back_to_scsi() {
        assert_eq!(normalize_block_driver("virtio-blk"), VIRTIO_BLOCK);
        assert_eq!(normalize_block_driver("floppy"), VIRTIO_SCSI);
    }

    #[test]
    fn vfio_paths_require_a_numeric_group() {
        assert!(is_vfio("/dev/vfio/16"));
        assert!(!is_vfio("/dev/vfio/vfio"));
        assert!(!is_vfio("/dev/sda"));
    }
}
