//! Request and response types of the guest agent protocol.

use serde::{Deserialize, Serialize};

/// Storage to be mounted by the guest before a container starts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Storage {
    /// Guest driver handling the storage (`"blk"`, `"virtiofs"`, ...).
    pub driver: String,
    /// Device or share the storage comes from.
    pub source: String,
    /// Filesystem type.
    pub fstype: String,
    /// Mount options.
    pub options: Vec<String>,
    /// Where the guest mounts it.
    pub mount_point: String,
}

/// Process to run inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestProcess {
    /// Argument vector; `args[0]` is the binary.
    pub args: Vec<String>,
    /// Environment, `KEY=value` entries.
    pub env: Vec<String>,
    /// Working directory.
    pub cwd: String,
    /// Allocate a terminal.
    pub terminal: bool,
}

/// Creates the guest side of the sandbox right after VM boot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSandboxRequest {
    /// Sandbox identifier.
    pub sandbox_id: String,
    /// Guest hostname.
    pub hostname: String,
    /// DNS servers pushed into the guest.
    pub dns: Vec<String>,
    /// Storages shared with every container.
    pub storages: Vec<Storage>,
    /// Whether containers share one PID namespace in the guest.
    pub sandbox_pidns: bool,
}

/// Creates one container in the guest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateContainerRequest {
    /// Container identifier.
    pub container_id: String,
    /// Exec identifier of the init process.
    pub exec_id: String,
    /// Container-specific storages (rootfs and volumes).
    pub storages: Vec<Storage>,
    /// Init process.
    pub process: GuestProcess,
}

/// Container resource assignment understood by the guest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestResources {
    /// CPU quota per period, microseconds. Negative means unlimited.
    pub cpu_quota: i64,
    /// CPU period, microseconds.
    pub cpu_period: u64,
    /// Memory limit in bytes. Zero means unlimited.
    pub memory_limit_bytes: i64,
}

/// Facts about the guest captured after boot.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GuestDetails {
    /// Memory hotplug granularity in bytes.
    pub mem_block_size_bytes: u64,
    /// Guest supports probe-based memory onlining.
    pub support_mem_hotplug_probe: bool,
}

/// An IP address with its prefix length.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAddress {
    /// Address in textual form.
    pub address: String,
    /// Prefix length in textual form.
    pub mask: String,
}

/// A guest network interface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    /// Guest device name.
    pub device: String,
    /// Interface name to assign.
    pub name: String,
    /// Addresses to configure.
    pub ip_addresses: Vec<IpAddress>,
    /// MTU.
    pub mtu: u64,
    /// MAC address.
    pub hw_addr: String,
}

/// A guest route.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Destination CIDR, empty for the default route.
    pub dest: String,
    /// Gateway address.
    pub gateway: String,
    /// Device the route goes through.
    pub device: String,
    /// Source address.
    pub source: String,
}
