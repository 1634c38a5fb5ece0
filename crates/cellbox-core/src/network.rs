//! Network capability: connects the sandbox VM to a host network namespace.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use cellbox_hypervisor::Hypervisor;

use crate::error::Result;

/// Host network the sandbox attaches to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Network namespace path, empty for the host namespace.
    pub netns_path: String,
    /// DNS servers pushed into the guest.
    pub dns: Vec<String>,
}

/// One host endpoint wired into the VM.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host interface name.
    pub name: String,
    /// MAC address presented to the guest.
    pub hw_addr: String,
    /// Endpoint kind (`"tap"`, `"veth"`, ...).
    pub endpoint_type: String,
}

/// Closure type executed inside a network namespace.
pub type NetnsJob = Box<dyn FnOnce() -> Result<()> + Send>;

/// Network capability of a sandbox.
///
/// Endpoints found in the configured namespace are handed to the hypervisor,
/// cold at boot or hotplugged when the VM came from a pre-warmed factory.
#[async_trait]
pub trait Network: Send + Sync {
    /// Scans the namespace and wires its endpoints into the VM.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace cannot be entered or an endpoint
    /// cannot be given to the hypervisor.
    async fn add(
        &self,
        config: &NetworkConfig,
        hypervisor: &dyn Hypervisor,
        hotplug: bool,
    ) -> Result<Vec<Endpoint>>;

    /// Unwires every endpoint added by [`Network::add`].
    async fn remove(&self, hypervisor: &dyn Hypervisor) -> Result<()>;

    /// Runs a closure inside the sandbox's network namespace.
    fn run(&self, netns_path: &str, job: NetnsJob) -> Result<()>;
}

/// Network used when the sandbox has no network, and in tests.
#[derive(Debug, Default)]
pub struct NoopNetwork;

#[async_trait]
impl Network for NoopNetwork {
    async fn add(
        &self,
        config: &NetworkConfig,
        _hypervisor: &dyn Hypervisor,
        hotplug: bool,
    ) -> Result<Vec<Endpoint>> {
        debug!(netns = %config.netns_path, hotplug, "no network configured");
        Ok(Vec::new())
    }

    async fn remove(&self, _hypervisor: &dyn Hypervisor) -> Result<()> {
        Ok(())
    }

    fn run(&self, _netns_path: &str, job: NetnsJob) -> Result<()> {
        job()
    }
}
