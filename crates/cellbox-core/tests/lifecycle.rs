//! End-to-end sandbox lifecycle tests against the in-memory backends.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use cellbox_agent::{GuestProcess, NoopAgent};
use cellbox_core::network::{Endpoint, NetnsJob, Network, NetworkConfig};
use cellbox_core::{
    ContainerConfig, ContainerResources, CoreError, FsDriver, NoopCgroupManager, NoopNetwork,
    RootFs, Sandbox, SandboxDeps, SandboxState,
};
use cellbox_device::DeviceInfo;
use cellbox_hypervisor::{Capabilities, Hypervisor, HypervisorConfig, MockHypervisor};

struct Backends {
    hypervisor: Arc<MockHypervisor>,
    agent: Arc<NoopAgent>,
    cgroup: Arc<NoopCgroupManager>,
    store: Arc<FsDriver>,
}

impl Backends {
    fn new(dir: &TempDir) -> Self {
        Self::with_hypervisor(dir, MockHypervisor::new())
    }

    fn with_hypervisor(dir: &TempDir, hypervisor: MockHypervisor) -> Self {
        Self {
            hypervisor: Arc::new(hypervisor),
            agent: Arc::new(NoopAgent::new()),
            cgroup: Arc::new(NoopCgroupManager::new()),
            store: Arc::new(
                FsDriver::new(Some(dir.path().join("state"))).expect("state dir"),
            ),
        }
    }

    fn deps(&self) -> SandboxDeps {
        SandboxDeps {
            hypervisor: self.hypervisor.clone(),
            agent: self.agent.clone(),
            network: Arc::new(NoopNetwork),
            store: self.store.clone(),
            cgroup: self.cgroup.clone(),
            factory: None,
        }
    }
}

/// Network whose teardown always fails, for exercising stop-path ordering.
struct StuckNetwork;

#[async_trait]
impl Network for StuckNetwork {
    async fn add(
        &self,
        _config: &NetworkConfig,
        _hypervisor: &dyn Hypervisor,
        _hotplug: bool,
    ) -> cellbox_core::Result<Vec<Endpoint>> {
        Ok(Vec::new())
    }

    async fn remove(&self, _hypervisor: &dyn Hypervisor) -> cellbox_core::Result<()> {
        Err(CoreError::ResourceBusy("netns still referenced".into()))
    }

    fn run(&self, _netns_path: &str, job: NetnsJob) -> cellbox_core::Result<()> {
        job()
    }
}

fn sandbox_config(id: &str, dir: &TempDir) -> cellbox_core::SandboxConfig {
    cellbox_core::SandboxConfig {
        id: id.into(),
        hostname: "guest".into(),
        hypervisor_config: HypervisorConfig {
            kernel_path: PathBuf::from("/opt/guest/vmlinux"),
            image_path: Some(PathBuf::from("/opt/guest/rootfs.img")),
            num_vcpus: 1,
            default_max_vcpus: 8,
            memory_mb: 1024,
            ..HypervisorConfig::default()
        },
        shared_fs_root: Some(dir.path().join("shared")),
        ..cellbox_core::SandboxConfig::default()
    }
}

fn container_config(id: &str) -> ContainerConfig {
    ContainerConfig {
        id: id.into(),
        rootfs: RootFs {
            source: PathBuf::from("/srv/rootfs").join(id),
            ..RootFs::default()
        },
        cmd: GuestProcess {
            args: vec!["/bin/sh".into()],
            cwd: "/".into(),
            ..GuestProcess::default()
        },
        ..ContainerConfig::default()
    }
}

fn block_info(name: &str, major: i64, minor: i64) -> DeviceInfo {
    DeviceInfo {
        container_path: format!("/dev/{name}"),
        host_path: format!("/dev/{name}"),
        dev_type: "b".into(),
        major,
        minor,
        ..DeviceInfo::default()
    }
}

async fn running_sandbox(backends: &Backends, dir: &TempDir) -> Sandbox {
    let mut sandbox = Sandbox::create(sandbox_config("sb1", dir), backends.deps())
        .await
        .expect("create");
    sandbox.start().await.expect("start");
    sandbox
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn full_lifecycle_walks_the_state_machine() {
    let dir = TempDir::new().unwrap();
    let backends = Backends::new(&dir);

    let mut sandbox = Sandbox::create(sandbox_config("sb1", &dir), backends.deps())
        .await
        .unwrap();
    assert_eq!(sandbox.state(), SandboxState::Ready);

    sandbox.start().await.unwrap();
    assert_eq!(sandbox.state(), SandboxState::Running);

    sandbox.pause().await.unwrap();
    assert_eq!(sandbox.state(), SandboxState::Paused);

    sandbox.resume().await.unwrap();
    assert_eq!(sandbox.state(), SandboxState::Running);

    sandbox.stop(false).await.unwrap();
    assert_eq!(sandbox.state(), SandboxState::Stopped);

    // a stopped sandbox can be restarted
    sandbox.start().await.unwrap();
    assert_eq!(sandbox.state(), SandboxState::Running);

    sandbox.stop(false).await.unwrap();
    sandbox.delete().await.unwrap();
}

#[tokio::test]
async fn illegal_transitions_are_rejected() {
    let dir = TempDir::new().unwrap();
    let backends = Backends::new(&dir);
    let mut sandbox = Sandbox::create(sandbox_config("sb1", &dir), backends.deps())
        .await
        .unwrap();

    // pausing a sandbox that never started
    assert!(matches!(
        sandbox.pause().await,
        Err(CoreError::InvalidStateTransition { .. })
    ));
    // resuming it either
    assert!(matches!(
        sandbox.resume().await,
        Err(CoreError::InvalidStateTransition { .. })
    ));

    sandbox.start().await.unwrap();
    // starting twice
    assert!(matches!(
        sandbox.start().await,
        Err(CoreError::InvalidStateTransition { .. })
    ));
    // deleting while running
    assert!(matches!(
        sandbox.delete().await,
        Err(CoreError::InvalidStateTransition { .. })
    ));
}

#[tokio::test]
async fn stop_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let backends = Backends::new(&dir);
    let mut sandbox = running_sandbox(&backends, &dir).await;

    sandbox.stop(false).await.unwrap();
    sandbox.stop(false).await.unwrap();
    sandbox.stop(true).await.unwrap();
    assert_eq!(sandbox.state(), SandboxState::Stopped);
}

#[tokio::test]
async fn force_stop_survives_backend_failures() {
    let dir = TempDir::new().unwrap();
    let backends = Backends::new(&dir);
    let mut sandbox = running_sandbox(&backends, &dir).await;

    backends.agent.inject_failure("stop_sandbox");
    backends.hypervisor.inject_failure("stop_vm");

    assert!(sandbox.stop(false).await.is_err());
    assert_eq!(sandbox.state(), SandboxState::Running);

    sandbox.stop(true).await.unwrap();
    assert_eq!(sandbox.state(), SandboxState::Stopped);
}

#[tokio::test]
async fn failed_boot_leaves_the_sandbox_ready() {
    let dir = TempDir::new().unwrap();
    let backends = Backends::new(&dir);
    let mut sandbox = Sandbox::create(sandbox_config("sb1", &dir), backends.deps())
        .await
        .unwrap();

    backends.hypervisor.inject_failure("start_vm");
    assert!(sandbox.start().await.is_err());
    assert_eq!(sandbox.state(), SandboxState::Ready);

    backends.hypervisor.clear_failures();
    sandbox.start().await.unwrap();
    assert_eq!(sandbox.state(), SandboxState::Running);
}

#[tokio::test]
async fn delete_destroys_the_stored_state_last() {
    let dir = TempDir::new().unwrap();
    let backends = Backends::new(&dir);
    let mut sandbox = Sandbox::create(sandbox_config("sb1", &dir), backends.deps())
        .await
        .unwrap();
    sandbox.delete().await.unwrap();
    drop(sandbox);

    let err = Sandbox::fetch("sb1", backends.deps())
        .await
        .err()
        .expect("fetch after delete must fail");
    assert!(matches!(err, CoreError::NotFound(_)));
}

// ============================================================================
// Persistence
// ============================================================================

#[tokio::test]
async fn fetch_restores_state_and_annotations() {
    let dir = TempDir::new().unwrap();
    let backends = Backends::new(&dir);

    let mut sandbox = running_sandbox(&backends, &dir).await;
    sandbox
        .set_annotations(HashMap::from([("tier".to_string(), "gold".to_string())]))
        .await
        .unwrap();
    sandbox.stop(false).await.unwrap();
    drop(sandbox);

    let restored = Sandbox::fetch("sb1", backends.deps()).await.unwrap();
    assert_eq!(restored.state(), SandboxState::Stopped);
    assert_eq!(restored.annotation("tier").as_deref(), Some("gold"));
}

#[tokio::test]
async fn the_store_lock_excludes_concurrent_owners() {
    let dir = TempDir::new().unwrap();
    let backends = Backends::new(&dir);

    let sandbox = Sandbox::create(sandbox_config("sb1", &dir), backends.deps())
        .await
        .unwrap();
    let err = Sandbox::fetch("sb1", backends.deps())
        .await
        .err()
        .expect("fetch under a held lock must fail");
    assert!(matches!(err, CoreError::ResourceBusy(_)));
    drop(sandbox);

    Sandbox::fetch("sb1", backends.deps()).await.unwrap();
}

#[tokio::test]
async fn stop_is_recorded_before_network_teardown() {
    let dir = TempDir::new().unwrap();
    let backends = Backends::new(&dir);
    let mut deps = backends.deps();
    deps.network = Arc::new(StuckNetwork);

    let mut sandbox = Sandbox::create(sandbox_config("sb1", &dir), deps)
        .await
        .unwrap();
    sandbox.start().await.unwrap();

    // teardown fails at the network step, but the stop is already on disk
    assert!(sandbox.stop(false).await.is_err());
    assert_eq!(sandbox.state(), SandboxState::Stopped);
    drop(sandbox);

    let restored = Sandbox::fetch("sb1", backends.deps()).await.unwrap();
    assert_eq!(restored.state(), SandboxState::Stopped);
}

// ============================================================================
// Containers
// ============================================================================

#[tokio::test]
async fn container_lifecycle_is_driven_through_the_sandbox() {
    let dir = TempDir::new().unwrap();
    let backends = Backends::new(&dir);
    let mut sandbox = running_sandbox(&backends, &dir).await;

    sandbox
        .create_container(container_config("c1"))
        .await
        .unwrap();
    assert!(matches!(
        sandbox.create_container(container_config("c1")).await,
        Err(CoreError::AlreadyExists(_))
    ));

    sandbox.start_container("c1").await.unwrap();
    assert_eq!(
        sandbox.get_container("c1").unwrap().state(),
        cellbox_core::ContainerState::Running
    );

    // exec into the running container
    let process = sandbox
        .enter_container("c1", GuestProcess::default())
        .await
        .unwrap();
    let written = sandbox
        .write_process_stdin("c1", &process.exec_id, b"ls\n")
        .await
        .unwrap();
    assert_eq!(written, 3);
    assert!(sandbox
        .read_process_stdout("c1", &process.exec_id, 4096)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(sandbox.wait_process("c1", &process.exec_id).await.unwrap(), 0);

    sandbox.stop_container("c1", false).await.unwrap();
    // deleting a stopped container succeeds, devices and config go with it
    sandbox.delete_container("c1", false).await.unwrap();
    assert!(sandbox.get_container("c1").is_none());

    let calls = backends.agent.calls();
    assert!(calls.contains(&"create_container c1".to_string()));
    assert!(calls.contains(&"start_container c1".to_string()));
    assert!(calls.contains(&"remove_container c1".to_string()));
}

#[tokio::test]
async fn container_ops_need_a_running_sandbox() {
    let dir = TempDir::new().unwrap();
    let backends = Backends::new(&dir);
    let mut sandbox = Sandbox::create(sandbox_config("sb1", &dir), backends.deps())
        .await
        .unwrap();

    assert!(matches!(
        sandbox.create_container(container_config("c1")).await,
        Err(CoreError::NotRunning(_))
    ));
    assert!(matches!(
        sandbox
            .enter_container("c1", GuestProcess::default())
            .await,
        Err(CoreError::NotRunning(_))
    ));
}

#[tokio::test]
async fn sigkill_always_succeeds() {
    let dir = TempDir::new().unwrap();
    let backends = Backends::new(&dir);
    let mut sandbox = running_sandbox(&backends, &dir).await;
    sandbox
        .create_container(container_config("c1"))
        .await
        .unwrap();
    sandbox.start_container("c1").await.unwrap();

    backends.agent.inject_failure("signal_process");
    // SIGTERM surfaces the failure, SIGKILL swallows it
    assert!(sandbox
        .signal_process("c1", "c1", libc::SIGTERM)
        .await
        .is_err());
    sandbox
        .signal_process("c1", "c1", libc::SIGKILL)
        .await
        .unwrap();
}

#[tokio::test]
async fn failed_container_creation_unwinds_its_devices() {
    let dir = TempDir::new().unwrap();
    let backends = Backends::new(&dir);
    let mut sandbox = running_sandbox(&backends, &dir).await;

    backends.agent.inject_failure("create_container");
    let mut config = container_config("c1");
    config.device_infos.push(block_info("xvda", 259, 0));

    assert!(sandbox.create_container(config).await.is_err());
    assert!(sandbox.get_container("c1").is_none());

    // the drive was plugged and unplugged again
    let log = backends.hypervisor.hotplug_log();
    assert!(log.iter().any(|l| l.starts_with("add block")));
    assert!(log.iter().any(|l| l.starts_with("del block")));
}

// ============================================================================
// Devices
// ============================================================================

#[tokio::test]
async fn drive_indices_are_smallest_free_and_reusable() {
    let dir = TempDir::new().unwrap();
    let backends = Backends::new(&dir);
    let sandbox = running_sandbox(&backends, &dir).await;

    let _a = sandbox.add_device(&block_info("xvda", 259, 0)).await.unwrap();
    let b = sandbox.add_device(&block_info("xvdb", 259, 1)).await.unwrap();
    let _c = sandbox.add_device(&block_info("xvdc", 259, 2)).await.unwrap();

    let log = backends.hypervisor.hotplug_log();
    assert!(log[0].contains("index 0"));
    assert!(log[1].contains("index 1"));
    assert!(log[2].contains("index 2"));

    // freeing the middle drive hands its index to the next one
    sandbox.remove_device(&b).await.unwrap();
    sandbox.add_device(&block_info("xvdd", 259, 3)).await.unwrap();
    let log = backends.hypervisor.hotplug_log();
    assert!(log.last().unwrap().contains("index 1"));
}

#[tokio::test]
async fn shared_devices_cannot_be_removed_while_attached() {
    let dir = TempDir::new().unwrap();
    let backends = Backends::new(&dir);
    let sandbox = running_sandbox(&backends, &dir).await;

    let first = sandbox.add_device(&block_info("xvda", 259, 0)).await.unwrap();
    // same major/minor: dedups onto the same device, second attach
    let second = sandbox.add_device(&block_info("xvda", 259, 0)).await.unwrap();
    assert_eq!(first, second);

    // one remove detaches once and drops one reference; the device survives
    sandbox.remove_device(&first).await.unwrap();
    sandbox.remove_device(&first).await.unwrap();
    // now it is gone
    assert!(matches!(
        sandbox.remove_device(&first).await,
        Err(CoreError::Device(_)) | Err(CoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn group_attach_keeps_earlier_members_on_failure() {
    let dir = TempDir::new().unwrap();
    let backends = Backends::new(&dir);
    let sandbox = running_sandbox(&backends, &dir).await;

    let good = block_info("xvda", 259, 0);
    // unresolvable: no host path and no such node to look up
    let bad = DeviceInfo {
        container_path: "/dev/broken".into(),
        dev_type: "b".into(),
        major: -1,
        minor: -1,
        ..DeviceInfo::default()
    };

    assert!(sandbox.attach_vfio_group(&[good, bad]).await.is_err());

    // the first member was plugged and never rolled back
    let log = backends.hypervisor.hotplug_log();
    assert!(log.iter().any(|l| l.starts_with("add block")));
    assert!(!log.iter().any(|l| l.starts_with("del block")));
}

#[tokio::test]
async fn cgroup_whitelisting_follows_the_sandbox_cgroup_setting() {
    let dir = TempDir::new().unwrap();
    let backends = Backends::new(&dir);
    let sandbox = running_sandbox(&backends, &dir).await;
    sandbox.add_device(&block_info("xvda", 259, 0)).await.unwrap();
    assert!(backends
        .cgroup
        .calls()
        .contains(&"add_device /dev/xvda".to_string()));

    let dir2 = TempDir::new().unwrap();
    let backends2 = Backends::new(&dir2);
    let mut config = sandbox_config("sb2", &dir2);
    config.sandbox_cgroup_only = true;
    let mut sandbox2 = Sandbox::create(config, backends2.deps()).await.unwrap();
    sandbox2.start().await.unwrap();
    sandbox2.add_device(&block_info("xvda", 259, 0)).await.unwrap();
    assert!(!backends2
        .cgroup
        .calls()
        .iter()
        .any(|c| c.starts_with("add_device")));
}

// ============================================================================
// Resources
// ============================================================================

#[tokio::test]
async fn two_half_cpu_containers_grow_the_vm_by_one_vcpu() {
    let dir = TempDir::new().unwrap();
    let backends = Backends::new(&dir);
    let mut sandbox = running_sandbox(&backends, &dir).await;

    for id in ["c1", "c2"] {
        let mut config = container_config(id);
        config.resources = ContainerResources {
            cpu_quota: 50_000,
            cpu_period: 100_000,
            ..ContainerResources::default()
        };
        sandbox.create_container(config).await.unwrap();
    }

    // 2 x 0.5 vCPU rounds to 1, on top of the single boot vCPU; the VM is
    // resized as the containers come in, no extra call needed
    assert_eq!(backends.hypervisor.vcpus(), 2);
    assert!(backends
        .agent
        .calls()
        .contains(&"online_cpu_mem 1 cpu_only=true".to_string()));
}

#[tokio::test]
async fn stopped_containers_release_their_vcpus() {
    let dir = TempDir::new().unwrap();
    let backends = Backends::new(&dir);
    let mut sandbox = running_sandbox(&backends, &dir).await;

    for id in ["c1", "c2"] {
        let mut config = container_config(id);
        config.resources = ContainerResources {
            cpu_quota: 100_000,
            cpu_period: 100_000,
            ..ContainerResources::default()
        };
        sandbox.create_container(config).await.unwrap();
        sandbox.start_container(id).await.unwrap();
    }
    assert_eq!(backends.hypervisor.vcpus(), 3);

    // a stopped container hands its vCPU back
    sandbox.stop_container("c2", false).await.unwrap();
    assert_eq!(backends.hypervisor.vcpus(), 2);
}

#[tokio::test]
async fn container_memory_is_hotplugged_on_top_of_the_boot_memory() {
    let dir = TempDir::new().unwrap();
    let backends = Backends::new(&dir);
    let mut sandbox = running_sandbox(&backends, &dir).await;

    let mut config = container_config("c1");
    config.resources.memory_limit_bytes = 512 << 20;
    sandbox.create_container(config).await.unwrap();

    // 1024 boot + 512 limit, in 128 MiB guest blocks
    assert_eq!(backends.hypervisor.memory_mb(), 1536);
}

#[tokio::test]
async fn missing_memory_hotplug_capability_is_only_a_warning() {
    let dir = TempDir::new().unwrap();
    let backends = Backends::with_hypervisor(
        &dir,
        MockHypervisor::with_capabilities(Capabilities {
            block_device_hotplug: true,
            memory_hotplug: false,
            fs_sharing: true,
        }),
    );
    let mut sandbox = running_sandbox(&backends, &dir).await;

    let mut config = container_config("c1");
    config.resources.memory_limit_bytes = 512 << 20;
    sandbox.create_container(config).await.unwrap();

    sandbox.update_resources().await.unwrap();
    assert_eq!(backends.hypervisor.memory_mb(), 1024);
}

#[tokio::test]
async fn malformed_cpusets_fail_resource_updates() {
    let dir = TempDir::new().unwrap();
    let backends = Backends::new(&dir);
    let mut sandbox = running_sandbox(&backends, &dir).await;

    let mut config = container_config("c1");
    config.resources.cpuset_cpus = "0-banana".into();

    // the sizing pass runs as part of creation and rejects the container
    assert!(matches!(
        sandbox.create_container(config).await,
        Err(CoreError::InvalidConfig(_))
    ));
    assert!(sandbox.get_container("c1").is_none());
}

#[tokio::test]
async fn pod_swap_grows_once_and_never_shrinks() {
    if tokio::process::Command::new("mkswap")
        .arg("--version")
        .output()
        .await
        .is_err()
    {
        eprintln!("mkswap not available, skipping");
        return;
    }

    let dir = TempDir::new().unwrap();
    let backends = Backends::new(&dir);
    let mut config = sandbox_config("sb1", &dir);
    config.hypervisor_config.guest_swap = true;
    let mut sandbox = Sandbox::create(config, backends.deps()).await.unwrap();
    sandbox.start().await.unwrap();

    let mut config = container_config("c1");
    config.resources.memory_limit_bytes = 256 << 20;
    config.resources.memory_swap_bytes = 512 << 20;
    config.resources.memory_swappiness = 60;
    sandbox.create_container(config).await.unwrap();

    sandbox.update_resources().await.unwrap();
    sandbox.update_resources().await.unwrap();

    let swap_adds = backends
        .hypervisor
        .hotplug_log()
        .iter()
        .filter(|l| l.contains("swap-"))
        .count();
    assert_eq!(swap_adds, 1, "swap is grow-only");
    assert!(backends
        .agent
        .calls()
        .iter()
        .any(|c| c.starts_with("add_swap")));
}

#[tokio::test]
async fn swap_is_not_plugged_when_the_guest_has_none() {
    let dir = TempDir::new().unwrap();
    let backends = Backends::new(&dir);
    let mut sandbox = running_sandbox(&backends, &dir).await;

    let mut config = container_config("c1");
    config.resources.memory_limit_bytes = 256 << 20;
    config.resources.memory_swap_bytes = 512 << 20;
    config.resources.memory_swappiness = 60;
    sandbox.create_container(config).await.unwrap();
    sandbox.update_resources().await.unwrap();

    assert!(!backends
        .hypervisor
        .hotplug_log()
        .iter()
        .any(|l| l.contains("swap-")));
    assert!(!backends
        .agent
        .calls()
        .iter()
        .any(|c| c.starts_with("add_swap")));
}
