//! The sandbox: one VM, its containers, and every resource wired into it.
//!
//! All lifecycle and container operations go through the owning [`Sandbox`]
//! value; capability backends (hypervisor, agent, network, cgroup, persist,
//! factory) are injected at construction and held as trait objects.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use cellbox_agent::{
    Agent, CreateContainerRequest, CreateSandboxRequest, GuestProcess, GuestResources,
};
use cellbox_device::{
    BlockDrive, Device, DeviceError, DeviceInfo, DeviceManager, DeviceReceiver, PciPath,
};
use cellbox_hypervisor::{HotplugDevice, Hypervisor};

use crate::cgroup::CgroupManager;
use crate::config::{ContainerConfig, SandboxConfig};
use crate::console::ConsoleWatcher;
use crate::container::{Container, Process};
use crate::error::{or_force, CoreError, Result};
use crate::factory::Factory;
use crate::fs_share::FilesystemShare;
use crate::monitor::{MonitorEvent, SandboxMonitor, DEFAULT_PROBE_INTERVAL};
use crate::network::Network;
use crate::persist::{PersistDriver, SandboxDiskState, StoreLock};
use crate::resources::{bytes_to_mib_ceil, sandbox_cpus, sandbox_memory};
use crate::state::{
    validate_sandbox_transition, ContainerState, SandboxState, SandboxStateInfo,
};

// ============================================================================
// Constants
// ============================================================================

/// How long to wait for the VM to boot.
const VM_START_TIMEOUT: Duration = Duration::from_secs(10);

/// Highest drive index a sandbox will hand out.
const MAX_BLOCK_INDEX: u32 = 65535;

/// Default root of the host-side share directories.
const DEFAULT_SHARED_ROOT: &str = "/run/cellbox/shared";

// ============================================================================
// Dependencies
// ============================================================================

/// Capability backends a sandbox is built from.
pub struct SandboxDeps {
    /// VM control.
    pub hypervisor: Arc<dyn Hypervisor>,
    /// Guest control.
    pub agent: Arc<dyn Agent>,
    /// Host networking.
    pub network: Arc<dyn Network>,
    /// State storage.
    pub store: Arc<dyn PersistDriver>,
    /// Host cgroup management.
    pub cgroup: Arc<dyn CgroupManager>,
    /// Optional source of pre-warmed VMs.
    pub factory: Option<Arc<dyn Factory>>,
}

// ============================================================================
// Sandbox
// ============================================================================

/// One VM-backed pod: the unit of isolation.
pub struct Sandbox {
    id: String,
    config: SandboxConfig,
    hypervisor: Arc<dyn Hypervisor>,
    agent: Arc<dyn Agent>,
    network: Arc<dyn Network>,
    store: Arc<dyn PersistDriver>,
    cgroup: Arc<dyn CgroupManager>,
    factory: Option<Arc<dyn Factory>>,
    device_manager: DeviceManager,
    fs_share: FilesystemShare,
    containers: HashMap<String, Container>,
    state: SandboxState,
    block_index: StdMutex<BTreeSet<u32>>,
    annotations: StdMutex<HashMap<String, String>>,
    guest_memory_block_size_mb: u32,
    guest_memory_hotplug_probe: bool,
    swap_devices: Vec<BlockDrive>,
    swap_size_bytes: i64,
    swap_device_num: u32,
    disable_vm_shutdown: bool,
    restored: bool,
    monitor: Option<SandboxMonitor>,
    console: Option<ConsoleWatcher>,
    _lock: StoreLock,
}

impl Sandbox {
    // ========================================================================
    // Construction
    // ========================================================================

    /// Creates a new sandbox: validates the configuration, takes the
    /// on-disk lock, registers the VM and stores the initial state.
    ///
    /// A leftover state record from a previous run is restored when
    /// readable; a restore failure on this path is not fatal.
    #[instrument(skip_all, fields(sandbox = %config.id))]
    pub async fn create(mut config: SandboxConfig, deps: SandboxDeps) -> Result<Self> {
        config.validate()?;
        let lock = deps.store.lock(&config.id, true)?;
        let mut sandbox = Self::assemble(config, deps, lock);

        match sandbox.store.load(&sandbox.id).await {
            Ok(disk) => {
                debug!(sandbox = %sandbox.id, "restoring previous state");
                sandbox.restore(disk).await;
            }
            Err(e) => debug!(sandbox = %sandbox.id, reason = %e, "starting fresh"),
        }

        if let Err(e) = sandbox.create_inner().await {
            let _ = sandbox.fs_share.cleanup().await;
            let _ = sandbox.store.destroy(&sandbox.id).await;
            return Err(e);
        }
        info!(sandbox = %sandbox.id, "sandbox created");
        Ok(sandbox)
    }

    /// Picks an existing sandbox up from its stored state.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when nothing is stored under `id`.
    #[instrument(skip(deps))]
    pub async fn fetch(id: &str, deps: SandboxDeps) -> Result<Self> {
        let lock = deps.store.lock(id, true)?;
        let disk = deps.store.load(id).await?;
        let mut sandbox = Self::assemble(disk.config.clone(), deps, lock);
        sandbox.restore(disk).await;
        // re-register so the control channel reattaches to the running VM
        sandbox
            .hypervisor
            .create_vm(id, &sandbox.config.hypervisor_config)
            .await?;
        info!(sandbox = id, state = %sandbox.state, "sandbox fetched");
        Ok(sandbox)
    }

    fn assemble(config: SandboxConfig, deps: SandboxDeps, lock: StoreLock) -> Self {
        let id = config.id.clone();
        let device_manager = DeviceManager::new(
            &config.hypervisor_config.block_device_driver,
            config.hypervisor_config.vhost_user_store_enabled,
        );
        let shared_root = config
            .shared_fs_root
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SHARED_ROOT));
        Self {
            fs_share: FilesystemShare::new(&id, shared_root),
            id,
            config,
            hypervisor: deps.hypervisor,
            agent: deps.agent,
            network: deps.network,
            store: deps.store,
            cgroup: deps.cgroup,
            factory: deps.factory,
            device_manager,
            containers: HashMap::new(),
            state: SandboxState::Ready,
            block_index: StdMutex::new(BTreeSet::new()),
            annotations: StdMutex::new(HashMap::new()),
            guest_memory_block_size_mb: 0,
            guest_memory_hotplug_probe: false,
            swap_devices: Vec::new(),
            swap_size_bytes: 0,
            swap_device_num: 0,
            disable_vm_shutdown: false,
            restored: false,
            monitor: None,
            console: None,
            _lock: lock,
        }
    }

    async fn create_inner(&mut self) -> Result<()> {
        {
            let mut annotations = self.annotations.lock().unwrap();
            if annotations.is_empty() {
                *annotations = self.config.annotations.clone();
            }
        }
        self.fs_share.prepare().await?;
        self.hypervisor
            .create_vm(&self.id, &self.config.hypervisor_config)
            .await?;
        self.persist().await
    }

    async fn restore(&mut self, disk: SandboxDiskState) {
        self.state = disk.state.state;
        *self.block_index.lock().unwrap() = disk.state.block_index_set;
        self.guest_memory_block_size_mb = disk.state.guest_memory_block_size_mb;
        self.guest_memory_hotplug_probe = disk.state.guest_memory_hotplug_probe;
        *self.annotations.lock().unwrap() = disk.annotations;
        self.swap_devices = disk.swap_devices;
        self.swap_size_bytes = disk.swap_size_bytes;
        self.swap_device_num = u32::try_from(self.swap_devices.len()).unwrap_or(u32::MAX);
        self.device_manager.load_devices(&disk.devices).await;
        self.containers = disk
            .containers
            .into_iter()
            .map(|c| (c.id.clone(), Container::from_disk(c)))
            .collect();
        self.restored = true;
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Sandbox ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> SandboxState {
        self.state
    }

    /// A container by ID.
    #[must_use]
    pub fn get_container(&self, container_id: &str) -> Option<&Container> {
        self.containers.get(container_id)
    }

    /// IDs of every container, unordered.
    #[must_use]
    pub fn container_ids(&self) -> Vec<String> {
        self.containers.keys().cloned().collect()
    }

    /// One annotation.
    #[must_use]
    pub fn annotation(&self, key: &str) -> Option<String> {
        self.annotations.lock().unwrap().get(key).cloned()
    }

    /// Merges annotations in and stores the result.
    pub async fn set_annotations(&self, annotations: HashMap<String, String>) -> Result<()> {
        self.annotations.lock().unwrap().extend(annotations);
        self.persist().await
    }

    /// A monitor watcher, once the sandbox is running.
    #[must_use]
    pub fn monitor_watcher(&self) -> Option<tokio::sync::broadcast::Receiver<MonitorEvent>> {
        self.monitor.as_ref().map(SandboxMonitor::subscribe)
    }

    /// Long-polls the guest for the next OOM event.
    pub async fn get_oom_event(&self) -> Result<String> {
        self.ensure_running()?;
        Ok(self.agent.get_oom_event().await?)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.state == SandboxState::Running {
            Ok(())
        } else {
            Err(CoreError::NotRunning(format!("sandbox {}", self.id)))
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Boots the VM and brings the sandbox to `Running`.
    #[instrument(skip(self), fields(sandbox = %self.id))]
    pub async fn start(&mut self) -> Result<()> {
        validate_sandbox_transition(&self.id, self.state, SandboxState::Running)?;

        let from_factory = self.adopt_factory_vm().await;
        if let Err(e) = self.boot_and_setup(from_factory).await {
            let _ = self.hypervisor.stop_vm(false).await;
            return Err(e);
        }

        self.state = SandboxState::Running;
        self.persist().await?;
        self.monitor = Some(SandboxMonitor::start(
            &self.id,
            Arc::clone(&self.hypervisor),
            DEFAULT_PROBE_INTERVAL,
        ));
        if self.config.hypervisor_config.enable_debug_console {
            match self.hypervisor.get_vm_console().await {
                Ok((protocol, path)) => {
                    self.console = Some(ConsoleWatcher::start(&self.id, &protocol, path));
                }
                Err(e) => warn!(sandbox = %self.id, error = %e, "no guest console"),
            }
        }
        info!(sandbox = %self.id, "sandbox running");
        Ok(())
    }

    async fn adopt_factory_vm(&mut self) -> bool {
        let Some(factory) = self.factory.clone() else {
            return false;
        };
        match factory
            .get_base_vm(&self.id, &self.config.hypervisor_config)
            .await
        {
            Ok(vm) => {
                debug!(sandbox = %self.id, "adopted a pre-warmed VM");
                self.hypervisor = vm.hypervisor;
                self.agent = vm.agent;
                true
            }
            Err(e) => {
                warn!(sandbox = %self.id, error = %e, "factory failed, cold booting");
                false
            }
        }
    }

    async fn boot_and_setup(&mut self, from_factory: bool) -> Result<()> {
        if from_factory {
            // the VM is already up; its network arrives via hotplug
            self.network
                .add(&self.config.network, self.hypervisor.as_ref(), true)
                .await?;
        } else {
            self.network
                .add(&self.config.network, self.hypervisor.as_ref(), false)
                .await?;
            self.hypervisor.start_vm(VM_START_TIMEOUT).await?;
        }

        self.disable_vm_shutdown = self.agent.init(&self.id).await?;
        if !self.restored {
            let req = CreateSandboxRequest {
                sandbox_id: self.id.clone(),
                hostname: self.config.hostname.clone(),
                dns: self.config.network.dns.clone(),
                storages: Vec::new(),
                sandbox_pidns: false,
            };
            self.agent.create_sandbox(&req).await?;
        }
        self.get_and_store_guest_details().await?;
        self.constrain_hypervisor().await;
        Ok(())
    }

    async fn get_and_store_guest_details(&mut self) -> Result<()> {
        let details = self.agent.get_guest_details().await?;
        self.guest_memory_block_size_mb =
            u32::try_from(details.mem_block_size_bytes >> 20).unwrap_or(u32::MAX);
        self.guest_memory_hotplug_probe = details.support_mem_hotplug_probe;
        debug!(
            sandbox = %self.id,
            block_size_mb = self.guest_memory_block_size_mb,
            probe = self.guest_memory_hotplug_probe,
            "guest details stored"
        );
        Ok(())
    }

    /// Puts the VMM and its vCPU threads into the sandbox cgroup. Failures
    /// leave the VM unconstrained but running.
    async fn constrain_hypervisor(&self) {
        match self.hypervisor.get_pids().await {
            Ok(pids) => {
                for pid in pids {
                    if let Err(e) = self.cgroup.add_process(pid).await {
                        warn!(sandbox = %self.id, pid, error = %e, "cgroup add failed");
                    }
                }
            }
            Err(e) => warn!(sandbox = %self.id, error = %e, "cannot read VMM pids"),
        }
        if let Ok(ids) = self.hypervisor.get_thread_ids().await {
            for tid in ids.vcpus.values() {
                if let Err(e) = self.cgroup.add_thread(*tid).await {
                    warn!(sandbox = %self.id, tid, error = %e, "cgroup add failed");
                }
            }
        }
    }

    /// Stops the sandbox. Already stopped is a no-op. With `force`, failing
    /// teardown steps are logged and skipped instead of aborting.
    #[instrument(skip(self), fields(sandbox = %self.id, force))]
    pub async fn stop(&mut self, force: bool) -> Result<()> {
        if self.state == SandboxState::Stopped {
            debug!(sandbox = %self.id, "already stopped");
            return Ok(());
        }
        validate_sandbox_transition(&self.id, self.state, SandboxState::Stopped)?;

        if let Some(console) = self.console.as_mut() {
            console.stop();
        }
        self.console = None;
        if let Some(monitor) = self.monitor.as_mut() {
            monitor.stop();
        }
        self.monitor = None;

        let vm_was_up = matches!(self.state, SandboxState::Running | SandboxState::Paused);
        for container_id in self.container_ids() {
            or_force(
                self.stop_container_inner(&container_id, force).await,
                force,
                "stop container",
            )?;
        }
        if vm_was_up {
            or_force(
                self.agent.stop_sandbox().await.map_err(Into::into),
                force,
                "agent sandbox teardown",
            )?;
            or_force(
                self.hypervisor
                    .stop_vm(self.disable_vm_shutdown)
                    .await
                    .map_err(Into::into),
                force,
                "stop VM",
            )?;
        }
        // record the stop before tearing the network down; a crash in
        // between must not leave a dead VM on record as running
        self.state = SandboxState::Stopped;
        self.persist().await?;
        or_force(
            self.network.remove(self.hypervisor.as_ref()).await,
            force,
            "remove network",
        )?;
        self.agent.disconnect().await;
        self.cleanup_swap().await;
        info!(sandbox = %self.id, "sandbox stopped");
        Ok(())
    }

    /// Freezes the VM and marks running containers paused.
    #[instrument(skip(self), fields(sandbox = %self.id))]
    pub async fn pause(&mut self) -> Result<()> {
        validate_sandbox_transition(&self.id, self.state, SandboxState::Paused)?;
        self.hypervisor.pause_vm().await?;
        self.state = SandboxState::Paused;
        for container in self.containers.values_mut() {
            if container.state() == ContainerState::Running {
                container.set_state(ContainerState::Paused)?;
            }
        }
        self.persist().await
    }

    /// Thaws a paused VM.
    #[instrument(skip(self), fields(sandbox = %self.id))]
    pub async fn resume(&mut self) -> Result<()> {
        if self.state != SandboxState::Paused {
            return Err(CoreError::InvalidStateTransition {
                object: self.id.clone(),
                from: self.state.to_string(),
                to: SandboxState::Running.to_string(),
            });
        }
        self.hypervisor.resume_vm().await?;
        self.state = SandboxState::Running;
        for container in self.containers.values_mut() {
            if container.state() == ContainerState::Paused {
                container.set_state(ContainerState::Running)?;
            }
        }
        self.persist().await
    }

    /// Deletes the sandbox. Host-side teardown is best effort; the stored
    /// state is destroyed last so a crash mid-delete stays recoverable.
    #[instrument(skip(self), fields(sandbox = %self.id))]
    pub async fn delete(&mut self) -> Result<()> {
        if !self.state.can_delete() {
            return Err(CoreError::InvalidStateTransition {
                object: self.id.clone(),
                from: self.state.to_string(),
                to: "deleted".to_string(),
            });
        }
        if let Some(monitor) = self.monitor.as_mut() {
            monitor.stop();
        }
        self.monitor = None;

        for container_id in self.container_ids() {
            let device_ids = self
                .containers
                .get(&container_id)
                .map(|c| c.device_ids.clone())
                .unwrap_or_default();
            self.release_devices(&device_ids).await;
            self.containers.remove(&container_id);
        }
        if let Err(e) = self.cgroup.delete().await {
            warn!(sandbox = %self.id, error = %e, "cgroup delete failed");
        }
        if let Err(e) = self.hypervisor.cleanup().await {
            warn!(sandbox = %self.id, error = %e, "hypervisor cleanup failed");
        }
        self.cleanup_swap().await;
        if let Err(e) = self.fs_share.cleanup().await {
            warn!(sandbox = %self.id, error = %e, "share cleanup failed");
        }
        self.store.destroy(&self.id).await?;
        info!(sandbox = %self.id, "sandbox deleted");
        Ok(())
    }

    // ========================================================================
    // Containers
    // ========================================================================

    /// Creates every container listed in the sandbox configuration that does
    /// not exist yet.
    pub async fn create_containers(&mut self) -> Result<()> {
        for config in self.config.containers.clone() {
            if !self.containers.contains_key(&config.id) {
                self.create_container_inner(config, false).await?;
            }
        }
        Ok(())
    }

    /// Creates one additional container in the running sandbox.
    #[instrument(skip(self, config), fields(sandbox = %self.id, container = %config.id))]
    pub async fn create_container(&mut self, config: ContainerConfig) -> Result<()> {
        self.create_container_inner(config, true).await
    }

    async fn create_container_inner(
        &mut self,
        config: ContainerConfig,
        append_config: bool,
    ) -> Result<()> {
        self.ensure_running()?;
        if self.containers.contains_key(&config.id) {
            return Err(CoreError::AlreadyExists(format!(
                "container {}",
                config.id
            )));
        }

        let mut container = Container::new(config.clone());
        let mut created_devices: Vec<String> = Vec::new();
        let result = self
            .build_container(&config, &mut container, &mut created_devices)
            .await;
        if let Err(e) = result {
            // unwind everything this container brought in
            self.release_devices(&created_devices).await;
            return Err(e);
        }
        container.device_ids = created_devices.clone();

        let container_id = container.id().to_string();
        if append_config {
            self.config.containers.push(config);
        }
        self.containers.insert(container_id.clone(), container);
        let committed = match self.persist().await {
            Ok(()) => self.update_resources().await,
            Err(e) => Err(e),
        };
        if let Err(e) = committed {
            // a sizing failure must not leave a half-added container behind
            self.containers.remove(&container_id);
            self.config.containers.retain(|c| c.id != container_id);
            self.release_devices(&created_devices).await;
            let _ = self.persist().await;
            return Err(e);
        }
        info!(sandbox = %self.id, "container created");
        Ok(())
    }

    async fn build_container(
        &mut self,
        config: &ContainerConfig,
        container: &mut Container,
        created_devices: &mut Vec<String>,
    ) -> Result<()> {
        for info in &config.device_infos {
            created_devices.push(self.add_device_inner(info).await?);
        }
        if config.rootfs.block_device {
            let info = DeviceInfo {
                container_path: "/".to_string(),
                host_path: config.rootfs.source.display().to_string(),
                dev_type: "b".to_string(),
                major: -1,
                minor: -1,
                ..DeviceInfo::default()
            };
            let device_id = self.add_device_inner(&info).await?;
            created_devices.push(device_id.clone());
            container.block_device_id = Some(device_id);
        }
        let storage = self
            .fs_share
            .share_rootfs(
                config,
                container.block_device_id.as_deref(),
                &self.device_manager,
            )
            .await?;
        let req = CreateContainerRequest {
            container_id: config.id.clone(),
            exec_id: config.id.clone(),
            storages: vec![storage],
            process: config.cmd.clone(),
        };
        self.agent.create_container(&req).await?;
        Ok(())
    }

    /// Starts a created container's init process.
    #[instrument(skip(self), fields(sandbox = %self.id))]
    pub async fn start_container(&mut self, container_id: &str) -> Result<()> {
        self.ensure_running()?;
        {
            let container = self.container(container_id)?;
            crate::state::validate_container_transition(
                container_id,
                container.state(),
                ContainerState::Running,
            )?;
        }
        self.agent.start_container(container_id).await?;
        let container = self.container_mut(container_id)?;
        container.state = ContainerState::Running;
        container.process = Some(Process {
            exec_id: container_id.to_string(),
            start_time: Utc::now(),
        });
        self.persist().await?;
        self.update_resources().await?;
        info!(sandbox = %self.id, container = container_id, "container started");
        Ok(())
    }

    /// Stops a container. Already stopped is a no-op. The VM shrinks to fit
    /// the containers that are left.
    #[instrument(skip(self), fields(sandbox = %self.id, force))]
    pub async fn stop_container(&mut self, container_id: &str, force: bool) -> Result<()> {
        self.ensure_running()?;
        self.stop_container_inner(container_id, force).await?;
        self.persist().await?;
        self.update_resources().await
    }

    async fn stop_container_inner(&mut self, container_id: &str, force: bool) -> Result<()> {
        let state = self.container(container_id)?.state();
        if state == ContainerState::Stopped {
            return Ok(());
        }
        if matches!(state, ContainerState::Running | ContainerState::Paused) {
            // a kill that misses an already dead process still succeeds
            if let Err(e) = self
                .agent
                .signal_process(container_id, container_id, libc::SIGKILL)
                .await
            {
                warn!(sandbox = %self.id, container = container_id, error = %e,
                    "kill before stop failed, continuing");
            }
            or_force(
                self.agent
                    .stop_container(container_id)
                    .await
                    .map_err(Into::into),
                force,
                "agent container stop",
            )?;
        }
        let container = self.container_mut(container_id)?;
        container.state = ContainerState::Stopped;
        debug!(sandbox = %self.id, container = container_id, "container stopped");
        Ok(())
    }

    /// Removes a stopped container and releases its devices.
    #[instrument(skip(self), fields(sandbox = %self.id, force))]
    pub async fn delete_container(&mut self, container_id: &str, force: bool) -> Result<()> {
        let state = self.container(container_id)?.state();
        if state != ContainerState::Stopped && !force {
            return Err(CoreError::InvalidStateTransition {
                object: container_id.to_string(),
                from: state.to_string(),
                to: "deleted".to_string(),
            });
        }
        if self.state == SandboxState::Running {
            or_force(
                self.agent
                    .remove_container(container_id)
                    .await
                    .map_err(Into::into),
                force,
                "guest container removal",
            )?;
        }
        let device_ids = self.container(container_id)?.device_ids.clone();
        self.release_devices(&device_ids).await;
        self.containers.remove(container_id);
        self.config.containers.retain(|c| c.id != container_id);
        self.persist().await?;
        if self.state == SandboxState::Running {
            self.update_resources().await?;
        }
        info!(sandbox = %self.id, container = container_id, "container deleted");
        Ok(())
    }

    /// Runs an extra process in a running container.
    pub async fn enter_container(
        &self,
        container_id: &str,
        process: GuestProcess,
    ) -> Result<Process> {
        self.ensure_running()?;
        let container = self.container(container_id)?;
        if container.state() != ContainerState::Running {
            return Err(CoreError::NotRunning(format!("container {container_id}")));
        }
        let exec_id = Uuid::new_v4().simple().to_string();
        self.agent
            .exec_process(container_id, &exec_id, &process)
            .await?;
        Ok(Process {
            exec_id,
            start_time: Utc::now(),
        })
    }

    /// Waits for a process to exit, returning its exit code.
    pub async fn wait_process(&self, container_id: &str, exec_id: &str) -> Result<i32> {
        self.ensure_running()?;
        self.container(container_id)?;
        Ok(self.agent.wait_process(container_id, exec_id).await?)
    }

    /// Signals a process. SIGKILL always succeeds; the guest may already
    /// have reaped the target.
    pub async fn signal_process(
        &self,
        container_id: &str,
        exec_id: &str,
        signal: i32,
    ) -> Result<()> {
        self.ensure_running()?;
        self.container(container_id)?;
        match self
            .agent
            .signal_process(container_id, exec_id, signal)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if signal == libc::SIGKILL => {
                warn!(sandbox = %self.id, container = container_id, error = %e,
                    "SIGKILL delivery failed, treating as success");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Resizes the terminal of a process.
    pub async fn winsize_process(
        &self,
        container_id: &str,
        exec_id: &str,
        rows: u32,
        cols: u32,
    ) -> Result<()> {
        self.ensure_running()?;
        self.container(container_id)?;
        Ok(self
            .agent
            .winsize_process(container_id, exec_id, rows, cols)
            .await?)
    }

    /// Writes stdin bytes to a process, returning how many were accepted.
    pub async fn write_process_stdin(
        &self,
        container_id: &str,
        exec_id: &str,
        data: &[u8],
    ) -> Result<usize> {
        self.ensure_running()?;
        self.container(container_id)?;
        Ok(self.agent.write_stdin(container_id, exec_id, data).await?)
    }

    /// Reads pending stdout bytes of a process.
    pub async fn read_process_stdout(
        &self,
        container_id: &str,
        exec_id: &str,
        max: u32,
    ) -> Result<Vec<u8>> {
        self.ensure_running()?;
        self.container(container_id)?;
        Ok(self.agent.read_stdout(container_id, exec_id, max).await?)
    }

    /// Reads pending stderr bytes of a process.
    pub async fn read_process_stderr(
        &self,
        container_id: &str,
        exec_id: &str,
        max: u32,
    ) -> Result<Vec<u8>> {
        self.ensure_running()?;
        self.container(container_id)?;
        Ok(self.agent.read_stderr(container_id, exec_id, max).await?)
    }

    /// Pushes new container resource limits into the guest.
    pub async fn update_container(
        &mut self,
        container_id: &str,
        resources: crate::config::ContainerResources,
    ) -> Result<()> {
        self.ensure_running()?;
        self.container(container_id)?;
        for config in &mut self.config.containers {
            if config.id == container_id {
                config.resources = resources.clone();
            }
        }
        let container = self.container_mut(container_id)?;
        container.config.resources = resources.clone();
        self.agent
            .update_container(
                container_id,
                GuestResources {
                    cpu_quota: resources.cpu_quota,
                    cpu_period: resources.cpu_period,
                    memory_limit_bytes: resources.memory_limit_bytes,
                },
            )
            .await?;
        self.update_resources().await
    }

    fn container(&self, container_id: &str) -> Result<&Container> {
        self.containers
            .get(container_id)
            .ok_or_else(|| CoreError::NotFound(format!("container {container_id}")))
    }

    fn container_mut(&mut self, container_id: &str) -> Result<&mut Container> {
        self.containers
            .get_mut(container_id)
            .ok_or_else(|| CoreError::NotFound(format!("container {container_id}")))
    }

    // ========================================================================
    // Resources
    // ========================================================================

    /// Re-sizes VM CPU and memory to fit the current container set. Stopped
    /// containers hand their share back.
    ///
    /// vCPUs are the container sum on top of the boot-time default; grown
    /// CPUs are onlined in the guest. Memory grows by hotplug when the
    /// backend supports it, with pod swap set up first and never shrunk.
    #[instrument(skip(self), fields(sandbox = %self.id))]
    pub async fn update_resources(&mut self) -> Result<()> {
        self.ensure_running()?;

        let (needed, memory_bytes, need_pod_swap, swap_bytes) = {
            let active: Vec<&Container> = self.containers.values().collect();
            let cpus = sandbox_cpus(&active)? + self.config.hypervisor_config.num_vcpus;
            let (memory, need_pod_swap, swap) =
                sandbox_memory(&active, self.config.hypervisor_config.guest_swap);
            (cpus, memory, need_pod_swap, swap)
        };
        let (old_vcpus, new_vcpus) = self.hypervisor.resize_vcpus(needed).await?;
        if new_vcpus > old_vcpus {
            self.agent
                .online_cpu_mem(new_vcpus - old_vcpus, true)
                .await?;
            if let Ok(ids) = self.hypervisor.get_thread_ids().await {
                for tid in ids.vcpus.values() {
                    if let Err(e) = self.cgroup.add_thread(*tid).await {
                        warn!(sandbox = %self.id, tid, error = %e, "cgroup add failed");
                    }
                }
            }
            debug!(sandbox = %self.id, old_vcpus, new_vcpus, "vCPUs grown");
        }

        if need_pod_swap || swap_bytes > 0 {
            let mut swap = swap_bytes;
            if need_pod_swap {
                // a swappy container without a limit swaps the whole VM
                swap = swap
                    .saturating_add(i64::from(self.config.hypervisor_config.memory_mb) << 20);
            }
            self.setup_swap(swap).await?;
        }
        if self.hypervisor.capabilities().memory_hotplug {
            let total_mb =
                self.config.hypervisor_config.memory_mb + bytes_to_mib_ceil(memory_bytes);
            let (new_mb, device) = self
                .hypervisor
                .resize_memory(
                    total_mb,
                    self.guest_memory_block_size_mb,
                    self.guest_memory_hotplug_probe,
                )
                .await?;
            if let Some(device) = device {
                if device.probe {
                    self.agent
                        .mem_hotplug_by_probe(device.addr, device.size_mb)
                        .await?;
                }
                self.agent.online_cpu_mem(0, false).await?;
            }
            debug!(sandbox = %self.id, new_mb, "guest memory sized");
        } else {
            warn!(sandbox = %self.id,
                "hypervisor cannot hotplug memory, guest memory left unchanged");
        }
        self.persist().await
    }

    // ========================================================================
    // Devices
    // ========================================================================

    /// Creates and attaches a device, returning its manager ID. A failed
    /// attach removes the device again.
    pub async fn add_device(&self, info: &DeviceInfo) -> Result<String> {
        self.ensure_running()?;
        let id = self.add_device_inner(info).await?;
        self.persist().await?;
        Ok(id)
    }

    async fn add_device_inner(&self, info: &DeviceInfo) -> Result<String> {
        let id = self.device_manager.new_device(info).await?;
        if let Err(e) = self.device_manager.attach_device(&id, self).await {
            let _ = self.device_manager.remove_device(&id).await;
            return Err(e.into());
        }
        Ok(id)
    }

    /// Detaches and drops one reference of a device.
    ///
    /// # Errors
    ///
    /// Returns `ResourceBusy` when other containers still hold the device
    /// attached.
    pub async fn remove_device(&self, device_id: &str) -> Result<()> {
        self.ensure_running()?;
        self.device_manager.detach_device(device_id, self).await?;
        self.device_manager
            .remove_device(device_id)
            .await
            .map_err(|e| match e {
                DeviceError::Busy(m) => CoreError::ResourceBusy(m),
                other => other.into(),
            })?;
        self.persist().await
    }

    /// Attaches every member of a VFIO group. The first failure aborts;
    /// members attached before it stay attached for the caller to inspect.
    pub async fn attach_vfio_group(&self, infos: &[DeviceInfo]) -> Result<Vec<String>> {
        self.ensure_running()?;
        let mut ids = Vec::with_capacity(infos.len());
        for info in infos {
            let id = self.device_manager.new_device(info).await?;
            self.device_manager.attach_device(&id, self).await?;
            ids.push(id);
        }
        self.persist().await?;
        Ok(ids)
    }

    /// Detaches and dereferences devices, logging failures. Used on unwind
    /// paths where a partial release must not mask the original error.
    async fn release_devices(&self, device_ids: &[String]) {
        for device_id in device_ids.iter().rev() {
            if self.device_manager.is_device_attached(device_id).await {
                if let Err(e) = self.device_manager.detach_device(device_id, self).await {
                    warn!(sandbox = %self.id, device = %device_id, error = %e,
                        "detach failed during release");
                }
            }
            if let Err(e) = self.device_manager.remove_device(device_id).await {
                warn!(sandbox = %self.id, device = %device_id, error = %e,
                    "remove failed during release");
            }
        }
    }

    async fn hotplug(&self, dev: &Device, add: bool) -> Result<Option<PciPath>> {
        let payload = match dev {
            Device::Block(d) => HotplugDevice::Block(d.drive.clone()),
            Device::Vfio(d) => HotplugDevice::Vfio(d.devices.clone()),
            Device::VhostUserBlk(d) | Device::VhostUserScsi(d) | Device::VhostUserNet(d) => {
                HotplugDevice::VhostUser(d.attrs.clone())
            }
            Device::Generic(_) => return Ok(None),
        };
        let host_path = &dev.base().info.host_path;
        if add {
            // the VMM may only open the node once its cgroup allows it
            if !self.config.sandbox_cgroup_only && !host_path.is_empty() {
                self.cgroup.add_device(host_path).await?;
            }
            Ok(self.hypervisor.hotplug_add_device(&payload).await?)
        } else {
            self.hypervisor.hotplug_remove_device(&payload).await?;
            if !self.config.sandbox_cgroup_only && !host_path.is_empty() {
                if let Err(e) = self.cgroup.remove_device(host_path).await {
                    warn!(sandbox = %self.id, error = %e, "cgroup device removal failed");
                }
            }
            Ok(None)
        }
    }

    fn reserve_block_index(&self) -> Result<u32> {
        let mut set = self.block_index.lock().unwrap();
        let mut index = 0u32;
        while set.contains(&index) {
            index += 1;
            if index > MAX_BLOCK_INDEX {
                return Err(CoreError::ResourceBusy(format!(
                    "sandbox {} has no free drive index",
                    self.id
                )));
            }
        }
        set.insert(index);
        Ok(index)
    }

    fn release_block_index(&self, index: u32) {
        self.block_index.lock().unwrap().remove(&index);
    }

    // ========================================================================
    // Swap
    // ========================================================================

    /// Grows pod swap to `swap_bytes`. Swap never shrinks; a smaller demand
    /// than what is already plugged is a no-op.
    async fn setup_swap(&mut self, swap_bytes: i64) -> Result<()> {
        if swap_bytes <= self.swap_size_bytes {
            return Ok(());
        }
        let delta = swap_bytes - self.swap_size_bytes;
        self.add_swap(delta).await?;
        self.swap_size_bytes = swap_bytes;
        Ok(())
    }

    async fn add_swap(&mut self, bytes: i64) -> Result<()> {
        let page = page_size();
        // mkswap refuses tiny files; pad a header page on top
        let size = bytes.max(page * 10) + page;
        let dir = self.store.run_path(&self.id);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("swap{}.img", self.swap_device_num));

        let file = tokio::fs::File::create(&path).await?;
        file.set_len(size.unsigned_abs()).await?;
        drop(file);
        let out = tokio::process::Command::new("mkswap")
            .arg(&path)
            .output()
            .await?;
        if !out.status.success() {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(CoreError::Swap(format!(
                "mkswap {}: {}",
                path.display(),
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }

        let drive = BlockDrive {
            file: path.display().to_string(),
            format: "raw".to_string(),
            id: format!("swap-{}", self.swap_device_num),
            index: self.swap_device_num,
            swap: true,
            ..BlockDrive::default()
        };
        let pci_path = self
            .hypervisor
            .hotplug_add_device(&HotplugDevice::Block(drive.clone()))
            .await?
            .map(|p| p.0)
            .unwrap_or_default();
        if let Err(e) = self.agent.add_swap(&pci_path).await {
            let _ = self
                .hypervisor
                .hotplug_remove_device(&HotplugDevice::Block(drive.clone()))
                .await;
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e.into());
        }
        self.swap_device_num += 1;
        self.swap_devices.push(drive);
        info!(sandbox = %self.id, bytes = size, "swap added");
        Ok(())
    }

    async fn cleanup_swap(&mut self) {
        for drive in self.swap_devices.drain(..) {
            if let Err(e) = tokio::fs::remove_file(&drive.file).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(sandbox = %self.id, file = %drive.file, error = %e,
                        "swap file removal failed");
                }
            }
        }
        self.swap_size_bytes = 0;
        self.swap_device_num = 0;
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    async fn persist(&self) -> Result<()> {
        let disk = SandboxDiskState {
            sandbox_id: self.id.clone(),
            state: SandboxStateInfo {
                state: self.state,
                block_index_set: self.block_index.lock().unwrap().clone(),
                guest_memory_block_size_mb: self.guest_memory_block_size_mb,
                guest_memory_hotplug_probe: self.guest_memory_hotplug_probe,
            },
            config: self.config.clone(),
            devices: self.device_manager.save_devices().await,
            containers: self.containers.values().map(Container::to_disk).collect(),
            annotations: self.annotations.lock().unwrap().clone(),
            swap_devices: self.swap_devices.clone(),
            swap_size_bytes: self.swap_size_bytes,
        };
        self.store.store(&disk).await
    }
}

fn page_size() -> i64 {
    // SAFETY: sysconf has no preconditions for _SC_PAGESIZE
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page > 0 {
        page
    } else {
        4096
    }
}

#[async_trait]
impl DeviceReceiver for Sandbox {
    async fn hotplug_add_device(
        &self,
        dev: &Device,
    ) -> cellbox_device::Result<Option<PciPath>> {
        self.hotplug(dev, true)
            .await
            .map_err(|e| DeviceError::Receiver(e.to_string()))
    }

    async fn hotplug_remove_device(&self, dev: &Device) -> cellbox_device::Result<()> {
        self.hotplug(dev, false)
            .await
            .map(|_| ())
            .map_err(|e| DeviceError::Receiver(e.to_string()))
    }

    async fn get_and_set_block_index(&self) -> cellbox_device::Result<u32> {
        self.reserve_block_index()
            .map_err(|e| DeviceError::Receiver(e.to_string()))
    }

    async fn unset_block_index(&self, index: u32) -> cellbox_device::Result<()> {
        self.release_block_index(index);
        Ok(())
    }
}
