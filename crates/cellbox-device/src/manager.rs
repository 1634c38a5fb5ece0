//! Device manager: creates, deduplicates and tracks every device a sandbox
//! knows about, keyed by manager-assigned hex IDs.

use std::collections::HashMap;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::{
    is_block, is_vfio, is_vhost_user_blk, normalize_block_driver, sysfs_host_path, DeviceInfo,
    DeviceType,
};
use crate::drivers::{self, BlockDevice, Device, DeviceReceiver, GenericDevice, VfioDevice,
    VhostUserDevice};
use crate::error::{DeviceError, Result};

/// How many random IDs to try before giving up on a collision streak.
const ID_RETRIES: usize = 5;

/// Persisted form of one device, tolerant of unknown kinds on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceState {
    /// Kind tag, see [`DeviceType::as_str`].
    pub device_type: String,
    /// Kind-specific payload.
    pub data: Value,
}

/// Owns the device set of one sandbox.
pub struct DeviceManager {
    block_driver: String,
    vhost_user_store_enabled: bool,
    devices: RwLock<HashMap<String, Device>>,
}

impl DeviceManager {
    /// Creates a manager with a normalized block driver.
    #[must_use]
    pub fn new(block_driver: &str, vhost_user_store_enabled: bool) -> Self {
        Self {
            block_driver: normalize_block_driver(block_driver),
            vhost_user_store_enabled,
            devices: RwLock::new(HashMap::new()),
        }
    }

    /// Creates (or dedups) a device for the given description and returns its
    /// ID. A device with the same major/minor as an existing one only gains a
    /// reference.
    pub async fn new_device(&self, dev_info: &DeviceInfo) -> Result<String> {
        let mut info = dev_info.clone();
        // pmem may point at raw files; its host path is authoritative, as is
        // any path the caller resolved up front
        if !info.pmem && info.host_path.is_empty() {
            info.host_path = sysfs_host_path(&info)?;
        }

        let mut devices = self.devices.write().await;
        if info.major >= 0 {
            if let Some(existing) = devices
                .values_mut()
                .find(|d| d.major_minor() == (info.major, info.minor))
            {
                existing.reference();
                return Ok(existing.id().to_string());
            }
        }

        let id = Self::new_device_id(&devices)?;
        info.id.clone_from(&id);

        let kind = self.classify(&info);
        if matches!(kind, DeviceType::Block | DeviceType::VhostUserBlk) {
            info.driver_options
                .insert("block-driver".to_string(), self.block_driver.clone());
        }
        if kind == DeviceType::Generic {
            info!(device = %info.host_path, "device has no hypervisor support, tracking only");
        }

        let mut dev = Device::new(kind, id.clone(), info);
        dev.reference();
        devices.insert(id.clone(), dev);
        Ok(id)
    }

    fn classify(&self, info: &DeviceInfo) -> DeviceType {
        if is_vfio(&info.host_path) {
            DeviceType::Vfio
        } else if is_vhost_user_blk(info, self.vhost_user_store_enabled) {
            DeviceType::VhostUserBlk
        } else if is_block(info) {
            DeviceType::Block
        } else {
            DeviceType::Generic
        }
    }

    fn new_device_id(devices: &HashMap<String, Device>) -> Result<String> {
        for _ in 0..ID_RETRIES {
            let bytes: [u8; 8] = rand::rng().random();
            let id = hex::encode(bytes);
            if !devices.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(DeviceError::IdsExhausted)
    }

    /// Drops one reference. The device leaves the manager once nobody
    /// references it, but never while it is still attached.
    pub async fn remove_device(&self, id: &str) -> Result<()> {
        let mut devices = self.devices.write().await;
        let dev = devices
            .get_mut(id)
            .ok_or_else(|| DeviceError::NotFound(id.to_string()))?;
        if dev.dereference() == 0 {
            if dev.is_attached() {
                return Err(DeviceError::Busy(id.to_string()));
            }
            devices.remove(id);
        }
        Ok(())
    }

    /// Attaches the device to the VM through the receiver.
    pub async fn attach_device(&self, id: &str, receiver: &dyn DeviceReceiver) -> Result<()> {
        let mut devices = self.devices.write().await;
        let dev = devices
            .get_mut(id)
            .ok_or_else(|| DeviceError::NotFound(id.to_string()))?;
        drivers::attach(dev, receiver).await
    }

    /// Detaches the device from the VM through the receiver.
    pub async fn detach_device(&self, id: &str, receiver: &dyn DeviceReceiver) -> Result<()> {
        let mut devices = self.devices.write().await;
        let dev = devices
            .get_mut(id)
            .ok_or_else(|| DeviceError::NotFound(id.to_string()))?;
        if !dev.is_attached() {
            return Err(DeviceError::NotAttached(id.to_string()));
        }
        drivers::detach(dev, receiver).await
    }

    /// Snapshot of one device.
    pub async fn get_device(&self, id: &str) -> Option<Device> {
        self.devices.read().await.get(id).cloned()
    }

    /// Snapshot of every device.
    pub async fn all_devices(&self) -> Vec<Device> {
        self.devices.read().await.values().cloned().collect()
    }

    /// Whether the device is currently attached.
    pub async fn is_device_attached(&self, id: &str) -> bool {
        self.devices
            .read()
            .await
            .get(id)
            .is_some_and(Device::is_attached)
    }

    /// Serializes every device for persistence.
    pub async fn save_devices(&self) -> Vec<DeviceState> {
        self.devices
            .read()
            .await
            .values()
            .filter_map(|dev| {
                let data = match dev {
                    Device::Generic(d) => serde_json::to_value(d),
                    Device::Block(d) => serde_json::to_value(d),
                    Device::Vfio(d) => serde_json::to_value(d),
                    Device::VhostUserBlk(d) | Device::VhostUserScsi(d) | Device::VhostUserNet(d) => {
                        serde_json::to_value(d)
                    }
                }
                .ok()?;
                Some(DeviceState {
                    device_type: dev.device_type().as_str().to_string(),
                    data,
                })
            })
            .collect()
    }

    /// Restores devices from persisted state. Unknown or malformed entries
    /// are logged and skipped so one stale record cannot block recovery.
    pub async fn load_devices(&self, states: &[DeviceState]) {
        let mut devices = self.devices.write().await;
        for state in states {
            let dev = match state.device_type.as_str() {
                "generic" => serde_json::from_value::<GenericDevice>(state.data.clone())
                    .map(Device::Generic),
                "block" => {
                    serde_json::from_value::<BlockDevice>(state.data.clone()).map(Device::Block)
                }
                "vfio" => {
                    serde_json::from_value::<VfioDevice>(state.data.clone()).map(Device::Vfio)
                }
                "vhost-user-blk" => serde_json::from_value::<VhostUserDevice>(state.data.clone())
                    .map(Device::VhostUserBlk),
                "vhost-user-scsi" => serde_json::from_value::<VhostUserDevice>(state.data.clone())
                    .map(Device::VhostUserScsi),
                "vhost-user-net" => serde_json::from_value::<VhostUserDevice>(state.data.clone())
                    .map(Device::VhostUserNet),
                other => {
                    warn!(device_type = other, "unrecognized device type, skipping");
                    continue;
                }
            };
            match dev {
                Ok(dev) => {
                    devices.insert(dev.id().to_string(), dev);
                }
                Err(e) => warn!(device_type = %state.device_type, error = %e,
                    "malformed device record, skipping"),
            }
        }
    }
}
