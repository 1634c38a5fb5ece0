//! The hypervisor capability trait and its wire types.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use cellbox_device::{BlockDrive, PciPath, VfioDev, VhostUserDeviceAttrs};

use crate::config::HypervisorConfig;
use crate::error::Result;

/// What a backend can do; callers degrade gracefully when a bit is missing.
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    /// Drives can be hotplugged.
    pub block_device_hotplug: bool,
    /// Guest memory can be resized at runtime.
    pub memory_hotplug: bool,
    /// A shared filesystem between host and guest is supported.
    pub fs_sharing: bool,
}

/// A memory DIMM added to the guest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryDevice {
    /// DIMM slot.
    pub slot: u32,
    /// Size in MiB.
    pub size_mb: u32,
    /// Guest physical address of the new region.
    pub addr: u64,
    /// Region must be onlined by a guest-side probe rather than ACPI.
    pub probe: bool,
}

/// vCPU number to host thread ID mapping.
#[derive(Debug, Clone, Default)]
pub struct VcpuThreadIds {
    /// Keyed by vCPU number.
    pub vcpus: HashMap<u32, u32>,
}

/// A network device given to the VM at boot or via hotplug.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetDevice {
    /// Host-side interface name (tap).
    pub name: String,
    /// Guest MAC address.
    pub hard_addr: String,
}

/// Payloads accepted by the hotplug entry points.
#[derive(Debug, Clone)]
pub enum HotplugDevice {
    /// A block drive.
    Block(BlockDrive),
    /// Every member of one VFIO group.
    Vfio(Vec<VfioDev>),
    /// A vhost-user backend.
    VhostUser(VhostUserDeviceAttrs),
    /// A memory DIMM.
    Memory(MemoryDevice),
    /// A network interface.
    Network(NetDevice),
}

/// Control surface of the sandbox VM.
///
/// Backends are selected when the sandbox is constructed and injected as an
/// owned trait object; nothing in the core layer names a concrete backend.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Registers the VM with the backend without starting it.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is rejected by the backend.
    async fn create_vm(&self, id: &str, config: &HypervisorConfig) -> Result<()>;

    /// Boots the VM, waiting up to `timeout` for it to come up.
    ///
    /// # Errors
    ///
    /// Returns an error if the VM fails to boot within the timeout.
    async fn start_vm(&self, timeout: Duration) -> Result<()>;

    /// Stops the VM. With `wait_only` the backend only waits for the guest
    /// to exit on its own (the agent drives the shutdown).
    ///
    /// # Errors
    ///
    /// Returns an error if the VM process cannot be stopped.
    async fn stop_vm(&self, wait_only: bool) -> Result<()>;

    /// Pauses all vCPUs.
    async fn pause_vm(&self) -> Result<()>;

    /// Resumes a paused VM.
    async fn resume_vm(&self) -> Result<()>;

    /// Hotplugs a device, returning its guest PCI path when the backend
    /// reports one.
    ///
    /// # Errors
    ///
    /// Returns an error if the device kind is unsupported or the guest
    /// rejects the plug.
    async fn hotplug_add_device(&self, dev: &HotplugDevice) -> Result<Option<PciPath>>;

    /// Hot-removes a previously hotplugged device.
    ///
    /// # Errors
    ///
    /// Returns an error if the device is unknown to the backend.
    async fn hotplug_remove_device(&self, dev: &HotplugDevice) -> Result<()>;

    /// Resizes the vCPU count. Returns `(old, new)` where `new` reflects any
    /// clamping against the configured ceiling.
    ///
    /// # Errors
    ///
    /// Returns an error if the VM is not running.
    async fn resize_vcpus(&self, new_vcpus: u32) -> Result<(u32, u32)>;

    /// Resizes guest memory to `new_mb`. `block_size_mb` is the guest's
    /// hotplug granularity; with `probe` the new region must be onlined by
    /// guest probing. Returns the resulting total and the DIMM added, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the VM is not running or the backend cannot
    /// satisfy the request.
    async fn resize_memory(
        &self,
        new_mb: u32,
        block_size_mb: u32,
        probe: bool,
    ) -> Result<(u32, Option<MemoryDevice>)>;

    /// Host PIDs of the VM (the VMM process first).
    async fn get_pids(&self) -> Result<Vec<u32>>;

    /// Host thread IDs of the vCPU threads.
    async fn get_thread_ids(&self) -> Result<VcpuThreadIds>;

    /// Console protocol and socket path of the guest console.
    async fn get_vm_console(&self) -> Result<(String, PathBuf)>;

    /// What this backend supports.
    fn capabilities(&self) -> Capabilities;

    /// The configuration the VM was created with.
    fn hypervisor_config(&self) -> HypervisorConfig;

    /// Removes any host-side leftovers (sockets, state files).
    async fn cleanup(&self) -> Result<()>;

    /// Drops the control channel without touching the VM.
    async fn disconnect(&self);
}
