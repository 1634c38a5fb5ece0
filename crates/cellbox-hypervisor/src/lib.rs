//! Hypervisor capability layer for cellbox.
//!
//! Defines the [`Hypervisor`] trait the sandbox drives its VM through, the
//! [`HypervisorConfig`] describing boot assets and resource ceilings, and an
//! in-memory [`MockHypervisor`] for tests. Concrete backends live outside
//! this workspace and are injected as trait objects.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod error;
pub mod mock;
pub mod traits;

pub use config::{HypervisorConfig, HypervisorType, DEFAULT_MEMORY_MB, DEFAULT_VCPUS};
pub use error::{HypervisorError, Result};
pub use mock::MockHypervisor;
pub use traits::{
    Capabilities, HotplugDevice, Hypervisor, MemoryDevice, NetDevice, VcpuThreadIds,
};
