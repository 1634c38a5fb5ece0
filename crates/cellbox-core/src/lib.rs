//! Sandbox lifecycle and resource orchestration for cellbox.
//!
//! One sandbox is one VM; containers run inside it and are driven only
//! through their sandbox. Capability backends are injected as trait objects:
//!
//! ```text
//!                 +--------------------------------------+
//!                 |               Sandbox                 |
//!                 |  state machine, containers, devices,  |
//!                 |  resources, swap, block indices       |
//!                 +---+------+------+------+------+------+
//!                     |      |      |      |      |
//!              Hypervisor  Agent Network Cgroup Persist
//!               (VM ctl) (guest) (netns) (host)  (disk)
//! ```
//!
//! Cross-process exclusion uses the persist driver's advisory file lock;
//! there is no global in-memory sandbox registry.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod cgroup;
pub mod config;
pub mod console;
pub mod container;
pub mod error;
pub mod factory;
pub mod fs_share;
pub mod monitor;
pub mod network;
pub mod persist;
pub mod resources;
pub mod sandbox;
pub mod state;

pub use cgroup::{CgroupManager, NoopCgroupManager};
pub use config::{ContainerConfig, ContainerResources, RootFs, SandboxConfig};
pub use container::{Container, Process};
pub use error::{CoreError, Result};
pub use factory::{BaseVm, Factory};
pub use monitor::{MonitorEvent, SandboxMonitor};
pub use network::{Endpoint, Network, NetworkConfig, NoopNetwork};
pub use persist::{FsDriver, PersistDriver, SandboxDiskState};
pub use sandbox::{Sandbox, SandboxDeps};
pub use state::{ContainerState, SandboxState};
