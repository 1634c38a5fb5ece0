//! An in-process hypervisor used by the test suites. Tracks the state a
//! real backend would and supports targeted failure injection.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use cellbox_device::PciPath;

use crate::config::HypervisorConfig;
use crate::error::{HypervisorError, Result};
use crate::traits::{Capabilities, HotplugDevice, Hypervisor, MemoryDevice, VcpuThreadIds};

#[derive(Default)]
struct MockState {
    vm_id: Option<String>,
    running: bool,
    paused: bool,
    vcpus: u32,
    memory_mb: u32,
    next_slot: u32,
    config: HypervisorConfig,
    hotplug_log: Vec<String>,
    fail_ops: HashSet<String>,
}

/// Test double implementing [`Hypervisor`] entirely in memory.
pub struct MockHypervisor {
    capabilities: Capabilities,
    state: Mutex<MockState>,
}

impl Default for MockHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHypervisor {
    /// A mock that claims support for everything.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capabilities(Capabilities {
            block_device_hotplug: true,
            memory_hotplug: true,
            fs_sharing: true,
        })
    }

    /// A mock with a custom capability set.
    #[must_use]
    pub fn with_capabilities(capabilities: Capabilities) -> Self {
        Self {
            capabilities,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Makes every future call to `op` fail until [`Self::clear_failures`].
    pub fn inject_failure(&self, op: &str) {
        self.state.lock().unwrap().fail_ops.insert(op.to_string());
    }

    /// Clears all injected failures.
    pub fn clear_failures(&self) {
        self.state.lock().unwrap().fail_ops.clear();
    }

    /// Description of every hotplug call seen so far, in order.
    #[must_use]
    pub fn hotplug_log(&self) -> Vec<String> {
        self.state.lock().unwrap().hotplug_log.clone()
    }

    /// Current vCPU count.
    #[must_use]
    pub fn vcpus(&self) -> u32 {
        self.state.lock().unwrap().vcpus
    }

    /// Current guest memory in MiB.
    #[must_use]
    pub fn memory_mb(&self) -> u32 {
        self.state.lock().unwrap().memory_mb
    }

    fn check(state: &MockState, op: &str) -> Result<()> {
        if state.fail_ops.contains(op) {
            return Err(HypervisorError::Failed(format!("injected {op} failure")));
        }
        Ok(())
    }

    fn vm_id(state: &MockState) -> String {
        state.vm_id.clone().unwrap_or_else(|| "<none>".to_string())
    }
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    async fn create_vm(&self, id: &str, config: &HypervisorConfig) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, "create_vm")?;
        state.vm_id = Some(id.to_string());
        state.config = config.clone();
        state.vcpus = config.num_vcpus;
        state.memory_mb = config.memory_mb;
        debug!(vm = id, "mock VM created");
        Ok(())
    }

    async fn start_vm(&self, _timeout: Duration) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, "start_vm")?;
        if state.vm_id.is_none() {
            return Err(HypervisorError::NotCreated("<none>".into()));
        }
        if state.running {
            return Err(HypervisorError::AlreadyInState(
                Self::vm_id(&state),
                "running".into(),
            ));
        }
        state.running = true;
        Ok(())
    }

    async fn stop_vm(&self, _wait_only: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, "stop_vm")?;
        state.running = false;
        state.paused = false;
        Ok(())
    }

    async fn pause_vm(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, "pause_vm")?;
        if !state.running {
            return Err(HypervisorError::NotRunning(Self::vm_id(&state)));
        }
        state.paused = true;
        Ok(())
    }

    async fn resume_vm(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, "resume_vm")?;
        if !state.paused {
            return Err(HypervisorError::AlreadyInState(
                Self::vm_id(&state),
                "running".into(),
            ));
        }
        state.paused = false;
        Ok(())
    }

    async fn hotplug_add_device(&self, dev: &HotplugDevice) -> Result<Option<PciPath>> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, "hotplug_add_device")?;
        if !state.running {
            return Err(HypervisorError::NotRunning(Self::vm_id(&state)));
        }
        let (desc, pci) = match dev {
            HotplugDevice::Block(drive) => (
                format!("add block {} index {}", drive.id, drive.index),
                Some(PciPath(format!("01/{:02}", drive.index))),
            ),
            HotplugDevice::Vfio(devs) => (format!("add vfio group of {}", devs.len()), None),
            HotplugDevice::VhostUser(attrs) => (format!("add vhost-user {}", attrs.dev_id), None),
            HotplugDevice::Memory(mem) => (format!("add memory {}MiB", mem.size_mb), None),
            HotplugDevice::Network(net) => (format!("add net {}", net.name), None),
        };
        state.hotplug_log.push(desc);
        Ok(pci)
    }

    async fn hotplug_remove_device(&self, dev: &HotplugDevice) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, "hotplug_remove_device")?;
        let desc = match dev {
            HotplugDevice::Block(drive) => format!("del block {}", drive.id),
            HotplugDevice::Vfio(devs) => format!("del vfio group of {}", devs.len()),
            HotplugDevice::VhostUser(attrs) => format!("del vhost-user {}", attrs.dev_id),
            HotplugDevice::Memory(mem) => format!("del memory {}MiB", mem.size_mb),
            HotplugDevice::Network(net) => format!("del net {}", net.name),
        };
        state.hotplug_log.push(desc);
        Ok(())
    }

    async fn resize_vcpus(&self, new_vcpus: u32) -> Result<(u32, u32)> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, "resize_vcpus")?;
        if !state.running {
            return Err(HypervisorError::NotRunning(Self::vm_id(&state)));
        }
        let old = state.vcpus;
        let mut new = new_vcpus.max(1);
        let ceiling = state.config.default_max_vcpus;
        if ceiling > 0 {
            new = new.min(ceiling);
        }
        state.vcpus = new;
        Ok((old, new))
    }

    async fn resize_memory(
        &self,
        new_mb: u32,
        block_size_mb: u32,
        probe: bool,
    ) -> Result<(u32, Option<MemoryDevice>)> {
        let mut state = self.state.lock().unwrap();
        Self::check(&state, "resize_memory")?;
        if !state.running {
            return Err(HypervisorError::NotRunning(Self::vm_id(&state)));
        }
        // memory hot-remove is not supported; shrinking is a no-op
        if new_mb <= state.memory_mb {
            return Ok((state.memory_mb, None));
        }
        let mut delta = new_mb - state.memory_mb;
        if block_size_mb > 0 {
            delta = delta.div_ceil(block_size_mb) * block_size_mb;
        }
        let slot = state.next_slot;
        state.next_slot += 1;
        state.memory_mb += delta;
        let device = MemoryDevice {
            slot,
            size_mb: delta,
            addr: 0x1_0000_0000 + (u64::from(slot) << 30),
            probe,
        };
        Ok((state.memory_mb, Some(device)))
    }

    async fn get_pids(&self) -> Result<Vec<u32>> {
        let state = self.state.lock().unwrap();
        Self::check(&state, "get_pids")?;
        Ok(vec![4242])
    }

    async fn get_thread_ids(&self) -> Result<VcpuThreadIds> {
        let state = self.state.lock().unwrap();
        Self::check(&state, "get_thread_ids")?;
        let mut ids = VcpuThreadIds::default();
        for vcpu in 0..state.vcpus {
            ids.vcpus.insert(vcpu, 4300 + vcpu);
        }
        Ok(ids)
    }

    async fn get_vm_console(&self) -> Result<(String, PathBuf)> {
        let state = self.state.lock().unwrap();
        Self::check(&state, "get_vm_console")?;
        let id = Self::vm_id(&state);
        Ok((
            "unix".to_string(),
            PathBuf::from(format!("/var/run/cellbox/{id}/console.sock")),
        ))
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn hypervisor_config(&self) -> HypervisorConfig {
        self.state.lock().unwrap().config.clone()
    }

    async fn cleanup(&self) -> Result<()> {
        let state = self.state.lock().unwrap();
        Self::check(&state, "cleanup")?;
        Ok(())
    }

    async fn disconnect(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config() -> HypervisorConfig {
        HypervisorConfig {
            kernel_path: PathBuf::from("/opt/guest/vmlinux"),
            image_path: Some(PathBuf::from("/opt/guest/rootfs.img")),
            num_vcpus: 2,
            default_max_vcpus: 4,
            memory_mb: 1024,
            ..HypervisorConfig::default()
        }
    }

    #[tokio::test]
    async fn vcpu_resize_clamps_to_the_ceiling() {
        let hv = MockHypervisor::new();
        hv.create_vm("vm1", &config()).await.unwrap();
        hv.start_vm(Duration::from_secs(10)).await.unwrap();

        let (old, new) = hv.resize_vcpus(8).await.unwrap();
        assert_eq!((old, new), (2, 4));
    }

    #[tokio::test]
    async fn memory_grows_in_block_size_steps() {
        let hv = MockHypervisor::new();
        hv.create_vm("vm1", &config()).await.unwrap();
        hv.start_vm(Duration::from_secs(10)).await.unwrap();

        let (total, dev) = hv.resize_memory(1500, 128, false).await.unwrap();
        let dev = dev.unwrap();
        // 476 MiB requested, rounded up to 4 blocks of 128
        assert_eq!(dev.size_mb, 512);
        assert_eq!(total, 1536);

        // shrinking is a no-op
        let (total, dev) = hv.resize_memory(512, 128, false).await.unwrap();
        assert_eq!(total, 1536);
        assert!(dev.is_none());
    }

    #[tokio::test]
    async fn injected_failures_surface_as_errors() {
        let hv = MockHypervisor::new();
        hv.create_vm("vm1", &config()).await.unwrap();
        hv.inject_failure("start_vm");
        assert!(hv.start_vm(Duration::from_secs(1)).await.is_err());
        hv.clear_failures();
        hv.start_vm(Duration::from_secs(1)).await.unwrap();
    }
}
