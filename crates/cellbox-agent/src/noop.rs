//! An agent that accepts everything. Used when no guest agent is configured
//! and by the test suites, which inspect the recorded call log.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{AgentError, Result};
use crate::traits::Agent;
use crate::types::{
    CreateContainerRequest, CreateSandboxRequest, GuestDetails, GuestProcess, GuestResources,
    Interface, Route,
};

#[derive(Default)]
struct NoopState {
    calls: Vec<String>,
    fail_ops: HashSet<String>,
    interfaces: Vec<Interface>,
    routes: Vec<Route>,
}

/// No-op [`Agent`] with call recording and failure injection.
pub struct NoopAgent {
    guest_details: GuestDetails,
    exit_code: i32,
    state: Mutex<NoopState>,
}

impl Default for NoopAgent {
    fn default() -> Self {
        Self::new()
    }
}

impl NoopAgent {
    /// An agent reporting a 128 MiB hotplug block size and no probe support.
    #[must_use]
    pub fn new() -> Self {
        Self::with_guest_details(GuestDetails {
            mem_block_size_bytes: 128 << 20,
            support_mem_hotplug_probe: false,
        })
    }

    /// An agent reporting custom guest details.
    #[must_use]
    pub fn with_guest_details(guest_details: GuestDetails) -> Self {
        Self {
            guest_details,
            exit_code: 0,
            state: Mutex::new(NoopState::default()),
        }
    }

    /// Sets the exit code every `wait_process` call reports.
    #[must_use]
    pub const fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = exit_code;
        self
    }

    /// Makes every future call to `op` fail.
    pub fn inject_failure(&self, op: &str) {
        self.state.lock().unwrap().fail_ops.insert(op.to_string());
    }

    /// Every recorded call, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn record(&self, call: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let op = call.split_whitespace().next().unwrap_or(call);
        state.calls.push(call.to_string());
        if state.fail_ops.contains(op) {
            return Err(AgentError::Request(format!("injected {op} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl Agent for NoopAgent {
    async fn init(&self, sandbox_id: &str) -> Result<bool> {
        debug!(sandbox = sandbox_id, "noop agent connected");
        self.record("init")?;
        Ok(false)
    }

    async fn create_sandbox(&self, req: &CreateSandboxRequest) -> Result<()> {
        self.record(&format!("create_sandbox {}", req.sandbox_id))
    }

    async fn stop_sandbox(&self) -> Result<()> {
        self.record("stop_sandbox")
    }

    async fn create_container(&self, req: &CreateContainerRequest) -> Result<()> {
        self.record(&format!("create_container {}", req.container_id))
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        self.record(&format!("start_container {container_id}"))
    }

    async fn stop_container(&self, container_id: &str) -> Result<()> {
        self.record(&format!("stop_container {container_id}"))
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        self.record(&format!("remove_container {container_id}"))
    }

    async fn exec_process(
        &self,
        container_id: &str,
        exec_id: &str,
        _process: &GuestProcess,
    ) -> Result<()> {
        self.record(&format!("exec_process {container_id}/{exec_id}"))
    }

    async fn signal_process(&self, container_id: &str, exec_id: &str, signal: i32) -> Result<()> {
        self.record(&format!("signal_process {container_id}/{exec_id} {signal}"))
    }

    async fn wait_process(&self, container_id: &str, exec_id: &str) -> Result<i32> {
        self.record(&format!("wait_process {container_id}/{exec_id}"))?;
        Ok(self.exit_code)
    }

    async fn winsize_process(
        &self,
        container_id: &str,
        exec_id: &str,
        rows: u32,
        cols: u32,
    ) -> Result<()> {
        self.record(&format!(
            "winsize_process {container_id}/{exec_id} {rows}x{cols}"
        ))
    }

    async fn write_stdin(&self, container_id: &str, exec_id: &str, data: &[u8]) -> Result<usize> {
        self.record(&format!(
            "write_stdin {container_id}/{exec_id} {}B",
            data.len()
        ))?;
        Ok(data.len())
    }

    async fn read_stdout(&self, container_id: &str, exec_id: &str, _max: u32) -> Result<Vec<u8>> {
        self.record(&format!("read_stdout {container_id}/{exec_id}"))?;
        Ok(Vec::new())
    }

    async fn read_stderr(&self, container_id: &str, exec_id: &str, _max: u32) -> Result<Vec<u8>> {
        self.record(&format!("read_stderr {container_id}/{exec_id}"))?;
        Ok(Vec::new())
    }

    async fn update_container(&self, container_id: &str, _resources: GuestResources) -> Result<()> {
        self.record(&format!("update_container {container_id}"))
    }

    async fn get_guest_details(&self) -> Result<GuestDetails> {
        self.record("get_guest_details")?;
        Ok(self.guest_details)
    }

    async fn online_cpu_mem(&self, nb_cpus: u32, cpu_only: bool) -> Result<()> {
        self.record(&format!("online_cpu_mem {nb_cpus} cpu_only={cpu_only}"))
    }

    async fn mem_hotplug_by_probe(&self, addr: u64, size_mb: u32) -> Result<()> {
        self.record(&format!("mem_hotplug_by_probe {addr:#x} {size_mb}MiB"))
    }

    async fn update_interface(&self, interface: &Interface) -> Result<()> {
        self.record(&format!("update_interface {}", interface.name))?;
        self.state.lock().unwrap().interfaces.push(interface.clone());
        Ok(())
    }

    async fn list_interfaces(&self) -> Result<Vec<Interface>> {
        self.record("list_interfaces")?;
        Ok(self.state.lock().unwrap().interfaces.clone())
    }

    async fn update_routes(&self, routes: &[Route]) -> Result<()> {
        self.record("update_routes")?;
        self.state.lock().unwrap().routes = routes.to_vec();
        Ok(())
    }

    async fn list_routes(&self) -> Result<Vec<Route>> {
        self.record("list_routes")?;
        Ok(self.state.lock().unwrap().routes.clone())
    }

    async fn add_swap(&self, pci_path: &str) -> Result<()> {
        self.record(&format!("add_swap {pci_path}"))
    }

    async fn get_oom_event(&self) -> Result<String> {
        self.record("get_oom_event")?;
        // nothing ever OOMs in the noop guest
        std::future::pending::<()>().await;
        unreachable!()
    }

    async fn check(&self) -> Result<()> {
        self.record("check")
    }

    async fn disconnect(&self) {
        let _ = self.record("disconnect");
    }
}
