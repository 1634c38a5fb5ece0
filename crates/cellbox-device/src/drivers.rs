//! Device drivers: one tagged enum covering every device kind the sandbox
//! can attach, with shared bookkeeping over the common base fields.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{
    scsi_address, virt_drive_name, BlockDrive, DeviceInfo, DeviceType, PciPath, VfioDev,
    VhostUserDeviceAttrs, NVDIMM, VIRTIO_BLOCK, VIRTIO_BLOCK_CCW, VIRTIO_MMIO, VIRTIO_SCSI,
};
use crate::error::{DeviceError, Result};

/// Sandbox-side callbacks a device needs while attaching or detaching.
///
/// The sandbox implements this; devices never talk to the hypervisor
/// directly.
#[async_trait]
pub trait DeviceReceiver: Send + Sync {
    /// Hotplugs the device into the running VM. Returns the guest PCI path
    /// when the hypervisor reports one.
    async fn hotplug_add_device(&self, dev: &Device) -> Result<Option<PciPath>>;

    /// Hot-removes the device from the running VM.
    async fn hotplug_remove_device(&self, dev: &Device) -> Result<()>;

    /// Reserves the smallest free sandbox-global block index.
    async fn get_and_set_block_index(&self) -> Result<u32>;

    /// Releases a previously reserved block index.
    async fn unset_block_index(&self, index: u32) -> Result<()>;
}

// ============================================================================
// Device kinds
// ============================================================================

/// Fields common to every device kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceBase {
    /// Manager-assigned identifier.
    pub id: String,
    /// Host-side description the device was created from.
    pub info: DeviceInfo,
    /// How many containers requested this device.
    pub ref_count: u64,
    /// How many times the device is attached to the VM.
    pub attach_count: u64,
}

impl DeviceBase {
    fn new(id: String, info: DeviceInfo) -> Self {
        Self {
            id,
            info,
            ref_count: 0,
            attach_count: 0,
        }
    }
}

/// Device without hypervisor support; tracked for bookkeeping only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenericDevice {
    pub base: DeviceBase,
}

/// Block device exposed to the guest as a drive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockDevice {
    pub base: DeviceBase,
    /// Drive description, populated while attaching.
    pub drive: BlockDrive,
}

/// VFIO passthrough device covering a whole IOMMU group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VfioDevice {
    pub base: DeviceBase,
    /// Group members, discovered from sysfs while attaching.
    pub devices: Vec<VfioDev>,
}

/// vhost-user backed device (block, SCSI or net).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VhostUserDevice {
    pub base: DeviceBase,
    pub attrs: VhostUserDeviceAttrs,
}

/// Every device kind the sandbox can manage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Device {
    Generic(GenericDevice),
    Block(BlockDevice),
    Vfio(VfioDevice),
    VhostUserBlk(VhostUserDevice),
    VhostUserScsi(VhostUserDevice),
    VhostUserNet(VhostUserDevice),
}

impl Device {
    pub(crate) fn new(kind: DeviceType, id: String, info: DeviceInfo) -> Self {
        let base = DeviceBase::new(id, info);
        match kind {
            DeviceType::Generic => Self::Generic(GenericDevice { base }),
            DeviceType::Block => Self::Block(BlockDevice {
                base,
                drive: BlockDrive::default(),
            }),
            DeviceType::Vfio => Self::Vfio(VfioDevice {
                base,
                devices: Vec::new(),
            }),
            DeviceType::VhostUserBlk => Self::VhostUserBlk(VhostUserDevice {
                base,
                attrs: VhostUserDeviceAttrs::default(),
            }),
            DeviceType::VhostUserScsi => Self::VhostUserScsi(VhostUserDevice {
                base,
                attrs: VhostUserDeviceAttrs::default(),
            }),
            DeviceType::VhostUserNet => Self::VhostUserNet(VhostUserDevice {
                base,
                attrs: VhostUserDeviceAttrs::default(),
            }),
        }
    }

    /// Kind tag of the device.
    #[must_use]
    pub const fn device_type(&self) -> DeviceType {
        match self {
            Self::Generic(_) => DeviceType::Generic,
            Self::Block(_) => DeviceType::Block,
            Self::Vfio(_) => DeviceType::Vfio,
            Self::VhostUserBlk(_) => DeviceType::VhostUserBlk,
            Self::VhostUserScsi(_) => DeviceType::VhostUserScsi,
            Self::VhostUserNet(_) => DeviceType::VhostUserNet,
        }
    }

    /// Shared base fields.
    #[must_use]
    pub const fn base(&self) -> &DeviceBase {
        match self {
            Self::Generic(d) => &d.base,
            Self::Block(d) => &d.base,
            Self::Vfio(d) => &d.base,
            Self::VhostUserBlk(d) | Self::VhostUserScsi(d) | Self::VhostUserNet(d) => &d.base,
        }
    }

    pub(crate) fn base_mut(&mut self) -> &mut DeviceBase {
        match self {
            Self::Generic(d) => &mut d.base,
            Self::Block(d) => &mut d.base,
            Self::Vfio(d) => &mut d.base,
            Self::VhostUserBlk(d) | Self::VhostUserScsi(d) | Self::VhostUserNet(d) => &mut d.base,
        }
    }

    /// Manager-assigned identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.base().id
    }

    /// Host major/minor pair.
    #[must_use]
    pub const fn major_minor(&self) -> (i64, i64) {
        let base = self.base();
        (base.info.major, base.info.minor)
    }

    /// Whether the device is attached to the VM at least once.
    #[must_use]
    pub const fn is_attached(&self) -> bool {
        self.base().attach_count > 0
    }

    pub(crate) fn reference(&mut self) -> u64 {
        let base = self.base_mut();
        base.ref_count = base.ref_count.saturating_add(1);
        base.ref_count
    }

    pub(crate) fn dereference(&mut self) -> u64 {
        let base = self.base_mut();
        base.ref_count = base.ref_count.saturating_sub(1);
        base.ref_count
    }
}

// ============================================================================
// Attach / detach
// ============================================================================

/// Bumps the attach count. Returns `true` when the real plug work must be
/// skipped because another container already did (or still needs) it.
fn bump_attach_count(base: &mut DeviceBase, attach: bool) -> Result<bool> {
    if attach {
        if base.attach_count == 0 {
            base.attach_count = 1;
            Ok(false)
        } else {
            base.attach_count += 1;
            Ok(true)
        }
    } else {
        match base.attach_count {
            0 => Err(DeviceError::NotAttached(base.id.clone())),
            1 => {
                base.attach_count = 0;
                Ok(false)
            }
            _ => {
                base.attach_count -= 1;
                Ok(true)
            }
        }
    }
}

/// Attaches a device through the receiver, rolling the attach count back on
/// failure.
pub async fn attach(dev: &mut Device, receiver: &dyn DeviceReceiver) -> Result<()> {
    if bump_attach_count(dev.base_mut(), true)? {
        return Ok(());
    }
    let res = match dev {
        Device::Generic(_) => {
            debug!(device = %dev.id(), "generic device tracked without hotplug");
            Ok(())
        }
        Device::Block(_) => attach_block(dev, receiver).await,
        Device::Vfio(_) => attach_vfio(dev, receiver).await,
        Device::VhostUserBlk(_) | Device::VhostUserScsi(_) | Device::VhostUserNet(_) => {
            attach_vhost_user(dev, receiver).await
        }
    };
    if res.is_err() {
        dev.base_mut().attach_count = dev.base().attach_count.saturating_sub(1);
    }
    res
}

/// Detaches a device through the receiver, restoring the attach count on
/// failure.
pub async fn detach(dev: &mut Device, receiver: &dyn DeviceReceiver) -> Result<()> {
    if bump_attach_count(dev.base_mut(), false)? {
        return Ok(());
    }
    let res = match dev {
        Device::Generic(_)
        | Device::VhostUserBlk(_)
        | Device::VhostUserScsi(_)
        | Device::VhostUserNet(_) => Ok(()),
        Device::Block(_) => detach_block(dev, receiver).await,
        Device::Vfio(_) => {
            let snapshot = dev.clone();
            receiver.hotplug_remove_device(&snapshot).await
        }
    };
    if res.is_err() {
        dev.base_mut().attach_count += 1;
    }
    res
}

async fn attach_block(dev: &mut Device, receiver: &dyn DeviceReceiver) -> Result<()> {
    let index = receiver.get_and_set_block_index().await?;
    match plug_block(dev, receiver, index).await {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = receiver.unset_block_index(index).await;
            Err(e)
        }
    }
}

async fn plug_block(dev: &mut Device, receiver: &dyn DeviceReceiver, index: u32) -> Result<()> {
    {
        let Device::Block(blk) = &mut *dev else {
            return Err(DeviceError::Unsupported("not a block device".into()));
        };
        let driver = blk
            .base
            .info
            .driver_options
            .get("block-driver")
            .cloned()
            .unwrap_or_else(|| VIRTIO_SCSI.to_string());
        let mut drive = BlockDrive {
            file: blk.base.info.host_path.clone(),
            format: "raw".to_string(),
            id: format!("drive-{}", blk.base.id),
            index,
            pmem: blk.base.info.pmem,
            read_only: blk.base.info.read_only,
            ..BlockDrive::default()
        };
        match driver.as_str() {
            VIRTIO_BLOCK | VIRTIO_MMIO | VIRTIO_BLOCK_CCW => {
                drive.virt_path = Some(format!("/dev/{}", virt_drive_name(index)?));
            }
            NVDIMM => drive.nvdimm_id = Some(format!("nv-{}", blk.base.id)),
            _ => drive.scsi_addr = Some(scsi_address(index)?),
        }
        blk.drive = drive;
    }
    let snapshot = dev.clone();
    let pci_path = receiver.hotplug_add_device(&snapshot).await?;
    if let Device::Block(blk) = dev {
        blk.drive.pci_path = pci_path;
    }
    Ok(())
}

async fn detach_block(dev: &mut Device, receiver: &dyn DeviceReceiver) -> Result<()> {
    let index = {
        let Device::Block(blk) = &*dev else {
            return Err(DeviceError::Unsupported("not a block device".into()));
        };
        if blk.drive.pmem {
            return Err(DeviceError::Unsupported(
                "persistent memory devices cannot be hot removed".into(),
            ));
        }
        blk.drive.index
    };
    let snapshot = dev.clone();
    receiver.hotplug_remove_device(&snapshot).await?;
    receiver.unset_block_index(index).await
}

async fn attach_vfio(dev: &mut Device, receiver: &dyn DeviceReceiver) -> Result<()> {
    {
        let Device::Vfio(vfio) = &mut *dev else {
            return Err(DeviceError::Unsupported("not a VFIO device".into()));
        };
        if vfio.devices.is_empty() {
            vfio.devices = vfio_group_devices(&vfio.base.info.host_path, &vfio.base.id)?;
        }
    }
    let snapshot = dev.clone();
    receiver.hotplug_add_device(&snapshot).await?;
    Ok(())
}

async fn attach_vhost_user(dev: &mut Device, receiver: &dyn DeviceReceiver) -> Result<()> {
    {
        let socket = dev.base().info.host_path.clone();
        let id = format!("vu-{}", dev.id());
        let (Device::VhostUserBlk(vu) | Device::VhostUserScsi(vu) | Device::VhostUserNet(vu)) =
            &mut *dev
        else {
            return Err(DeviceError::Unsupported("not a vhost-user device".into()));
        };
        vu.attrs.dev_id = id;
        vu.attrs.socket_path = socket;
    }
    let snapshot = dev.clone();
    receiver.hotplug_add_device(&snapshot).await?;
    Ok(())
}

/// Enumerates the members of a VFIO group from sysfs.
fn vfio_group_devices(group_path: &str, dev_id: &str) -> Result<Vec<VfioDev>> {
    let group = Path::new(group_path)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| DeviceError::InvalidConfig(format!("bad VFIO group path {group_path}")))?;
    let dir = format!("/sys/kernel/iommu_groups/{group}/devices");
    let mut devs = Vec::new();
    for (i, entry) in std::fs::read_dir(&dir)?.enumerate() {
        let name = entry?.file_name().to_string_lossy().into_owned();
        // strip the PCI domain from the BDF
        let bdf = name
            .split_once(':')
            .map_or_else(|| name.clone(), |(_, rest)| rest.to_string());
        devs.push(VfioDev {
            id: format!("{dev_id}-{i}"),
            bdf,
            sysfs_dev: format!("{dir}/{name}"),
        });
    }
    if devs.is_empty() {
        return Err(DeviceError::InvalidConfig(format!(
            "VFIO group {group} has no devices"
        )));
    }
    Ok(devs)
}
