//! Sandbox and container configuration.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use cellbox_agent::GuestProcess;
use cellbox_device::DeviceInfo;
use cellbox_hypervisor::HypervisorConfig;

use crate::error::{CoreError, Result};
use crate::network::NetworkConfig;

/// Resource assignment of one container, cgroup-style.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerResources {
    /// CPU quota per period, microseconds. Zero or negative means unlimited.
    pub cpu_quota: i64,
    /// CPU period, microseconds.
    pub cpu_period: u64,
    /// Cpuset list, e.g. `"0-2,4"`. Used when no quota is set.
    pub cpuset_cpus: String,
    /// Memory limit in bytes. Zero means unlimited.
    pub memory_limit_bytes: i64,
    /// Memory+swap limit in bytes. Swap is wanted when this exceeds the
    /// memory limit and swappiness allows it.
    pub memory_swap_bytes: i64,
    /// Swappiness; zero disables swap for this container.
    pub memory_swappiness: i64,
}

/// Root filesystem of a container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RootFs {
    /// Host path or block device backing the rootfs.
    pub source: PathBuf,
    /// Filesystem type, empty when the source is a directory to share.
    pub fstype: String,
    /// Source is a block device to hotplug rather than a directory.
    pub block_device: bool,
}

/// Configuration of one container inside a sandbox.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Container identifier, unique within the sandbox.
    pub id: String,
    /// Root filesystem.
    pub rootfs: RootFs,
    /// Init process.
    pub cmd: GuestProcess,
    /// Resource assignment.
    pub resources: ContainerResources,
    /// Devices to pass through.
    pub device_infos: Vec<DeviceInfo>,
    /// Free-form annotations.
    pub annotations: HashMap<String, String>,
}

/// Configuration of a whole sandbox.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Sandbox identifier.
    pub id: String,
    /// Guest hostname.
    pub hostname: String,
    /// VM configuration.
    pub hypervisor_config: HypervisorConfig,
    /// Host network to connect the VM to.
    pub network: NetworkConfig,
    /// Containers created together with the sandbox. More can be added later.
    pub containers: Vec<ContainerConfig>,
    /// Free-form annotations.
    pub annotations: HashMap<String, String>,
    /// Constrain only the VMM in the sandbox cgroup; device nodes are then
    /// not whitelisted per hotplug.
    pub sandbox_cgroup_only: bool,
    /// Root of the host-side share directories. Defaults to the runtime run
    /// directory when unset.
    pub shared_fs_root: Option<PathBuf>,
}

fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

impl SandboxConfig {
    /// Validates the whole configuration, normalizing the hypervisor part in
    /// place.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` on a bad sandbox or container ID, a duplicate
    /// container ID, or a rejected hypervisor configuration.
    pub fn validate(&mut self) -> Result<()> {
        if !valid_id(&self.id) {
            return Err(CoreError::InvalidConfig(format!(
                "invalid sandbox ID {:?}",
                self.id
            )));
        }
        self.hypervisor_config
            .validate()
            .map_err(|e| CoreError::InvalidConfig(e.to_string()))?;
        let mut seen = HashSet::new();
        for container in &self.containers {
            if !valid_id(&container.id) {
                return Err(CoreError::InvalidConfig(format!(
                    "invalid container ID {:?}",
                    container.id
                )));
            }
            if !seen.insert(container.id.as_str()) {
                return Err(CoreError::InvalidConfig(format!(
                    "duplicate container ID {}",
                    container.id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> SandboxConfig {
        SandboxConfig {
            id: "sb-1".into(),
            hypervisor_config: HypervisorConfig {
                kernel_path: PathBuf::from("/opt/guest/vmlinux"),
                image_path: Some(PathBuf::from("/opt/guest/rootfs.img")),
                ..HypervisorConfig::default()
            },
            ..SandboxConfig::default()
        }
    }

    #[test]
    fn ids_are_checked() {
        let mut cfg = base();
        assert!(cfg.validate().is_ok());

        cfg.id = "../escape".into();
        assert!(matches!(cfg.validate(), Err(CoreError::InvalidConfig(_))));

        cfg.id = String::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn duplicate_container_ids_are_rejected() {
        let mut cfg = base();
        cfg.containers = vec![
            ContainerConfig {
                id: "c1".into(),
                ..ContainerConfig::default()
            },
            ContainerConfig {
                id: "c1".into(),
                ..ContainerConfig::default()
            },
        ];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn hypervisor_validation_is_reported_as_config_error() {
        let mut cfg = base();
        cfg.hypervisor_config.image_path = None;
        assert!(matches!(cfg.validate(), Err(CoreError::InvalidConfig(_))));
    }
}
