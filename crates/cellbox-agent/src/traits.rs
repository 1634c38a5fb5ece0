//! The guest agent capability trait.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    CreateContainerRequest, CreateSandboxRequest, GuestDetails, GuestResources, Interface, Route,
};

/// Control channel into the guest.
///
/// One implementation per transport; the sandbox owns it as a trait object
/// and never assumes a concrete wire protocol.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Establishes the channel. Returns `true` when the agent takes over VM
    /// shutdown, in which case the hypervisor only waits for guest exit.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel cannot be established.
    async fn init(&self, sandbox_id: &str) -> Result<bool>;

    /// Creates the guest side of the sandbox.
    async fn create_sandbox(&self, req: &CreateSandboxRequest) -> Result<()>;

    /// Tears down the guest side of the sandbox.
    async fn stop_sandbox(&self) -> Result<()>;

    /// Creates a container in the guest.
    async fn create_container(&self, req: &CreateContainerRequest) -> Result<()>;

    /// Starts a created container.
    async fn start_container(&self, container_id: &str) -> Result<()>;

    /// Stops a running container.
    async fn stop_container(&self, container_id: &str) -> Result<()>;

    /// Removes a stopped container from the guest.
    async fn remove_container(&self, container_id: &str) -> Result<()>;

    /// Runs an additional process inside a running container.
    async fn exec_process(
        &self,
        container_id: &str,
        exec_id: &str,
        process: &crate::types::GuestProcess,
    ) -> Result<()>;

    /// Sends a signal to a process.
    async fn signal_process(&self, container_id: &str, exec_id: &str, signal: i32) -> Result<()>;

    /// Waits for a process to exit, returning its exit code.
    async fn wait_process(&self, container_id: &str, exec_id: &str) -> Result<i32>;

    /// Resizes the terminal of a process.
    async fn winsize_process(
        &self,
        container_id: &str,
        exec_id: &str,
        rows: u32,
        cols: u32,
    ) -> Result<()>;

    /// Writes stdin bytes to a process, returning how many were accepted.
    async fn write_stdin(&self, container_id: &str, exec_id: &str, data: &[u8]) -> Result<usize>;

    /// Reads pending stdout bytes of a process, up to `max`.
    async fn read_stdout(&self, container_id: &str, exec_id: &str, max: u32) -> Result<Vec<u8>>;

    /// Reads pending stderr bytes of a process, up to `max`.
    async fn read_stderr(&self, container_id: &str, exec_id: &str, max: u32) -> Result<Vec<u8>>;

    /// Applies new resource limits to a container.
    async fn update_container(&self, container_id: &str, resources: GuestResources) -> Result<()>;

    /// Facts about the guest kernel.
    async fn get_guest_details(&self) -> Result<GuestDetails>;

    /// Onlines hotplugged CPUs (and memory unless `cpu_only`).
    async fn online_cpu_mem(&self, nb_cpus: u32, cpu_only: bool) -> Result<()>;

    /// Onlines a probe-based memory region at `addr`.
    async fn mem_hotplug_by_probe(&self, addr: u64, size_mb: u32) -> Result<()>;

    /// Configures a guest interface.
    async fn update_interface(&self, interface: &Interface) -> Result<()>;

    /// Lists guest interfaces.
    async fn list_interfaces(&self) -> Result<Vec<Interface>>;

    /// Replaces the guest routing table.
    async fn update_routes(&self, routes: &[Route]) -> Result<()>;

    /// Lists guest routes.
    async fn list_routes(&self) -> Result<Vec<Route>>;

    /// Registers a hotplugged swap drive by its guest PCI path.
    async fn add_swap(&self, pci_path: &str) -> Result<()>;

    /// Blocks until the guest reports an OOM event, returning the victim
    /// container ID.
    async fn get_oom_event(&self) -> Result<String>;

    /// Liveness probe.
    async fn check(&self) -> Result<()>;

    /// Drops the channel without touching the guest.
    async fn disconnect(&self);
}
