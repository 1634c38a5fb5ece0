//! Cgroup capability: host-side resource constraints around the VMM.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::Result;

/// Host cgroup management for the sandbox.
///
/// The sandbox cgroup holds the VMM process and its vCPU threads. Unless the
/// sandbox is configured cgroup-only, hotplugged device nodes are
/// whitelisted here before the hypervisor sees them.
#[async_trait]
pub trait CgroupManager: Send + Sync {
    /// Moves a host process into the sandbox cgroup.
    async fn add_process(&self, pid: u32) -> Result<()>;

    /// Moves a host thread (a vCPU) into the sandbox cgroup.
    async fn add_thread(&self, tid: u32) -> Result<()>;

    /// Whitelists a host device node for the VMM.
    async fn add_device(&self, host_path: &str) -> Result<()>;

    /// Removes a device node from the whitelist.
    async fn remove_device(&self, host_path: &str) -> Result<()>;

    /// Updates the cpuset assigned to the sandbox cgroup.
    async fn update_cpuset(&self, cpuset: &str) -> Result<()>;

    /// Deletes the sandbox cgroup.
    async fn delete(&self) -> Result<()>;
}

/// Cgroup manager that records calls but constrains nothing. Used when the
/// host offers no cgroup delegation, and in tests.
#[derive(Debug, Default)]
pub struct NoopCgroupManager {
    calls: Mutex<Vec<String>>,
}

impl NoopCgroupManager {
    /// A fresh recording manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every recorded call, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl CgroupManager for NoopCgroupManager {
    async fn add_process(&self, pid: u32) -> Result<()> {
        self.record(format!("add_process {pid}"));
        Ok(())
    }

    async fn add_thread(&self, tid: u32) -> Result<()> {
        self.record(format!("add_thread {tid}"));
        Ok(())
    }

    async fn add_device(&self, host_path: &str) -> Result<()> {
        self.record(format!("add_device {host_path}"));
        Ok(())
    }

    async fn remove_device(&self, host_path: &str) -> Result<()> {
        self.record(format!("remove_device {host_path}"));
        Ok(())
    }

    async fn update_cpuset(&self, cpuset: &str) -> Result<()> {
        self.record(format!("update_cpuset {cpuset}"));
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        self.record("delete".to_string());
        Ok(())
    }
}
