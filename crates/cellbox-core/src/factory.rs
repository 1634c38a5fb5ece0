//! VM factory capability: hands out pre-warmed VMs so sandbox start skips
//! the cold boot.

use std::sync::Arc;

use async_trait::async_trait;

use cellbox_agent::Agent;
use cellbox_hypervisor::{Hypervisor, HypervisorConfig};

use crate::error::Result;

/// A booted VM handed out by a factory. The sandbox adopts both handles and
/// then hotplugs its network and resources into the running guest.
pub struct BaseVm {
    /// Hypervisor already running the VM.
    pub hypervisor: Arc<dyn Hypervisor>,
    /// Agent already connected to the guest.
    pub agent: Arc<dyn Agent>,
}

/// Source of pre-warmed VMs.
#[async_trait]
pub trait Factory: Send + Sync {
    /// A VM compatible with `config`, booted and waiting.
    ///
    /// # Errors
    ///
    /// Returns an error when no compatible VM can be produced; the caller
    /// then falls back to a cold boot.
    async fn get_base_vm(&self, sandbox_id: &str, config: &HypervisorConfig) -> Result<BaseVm>;
}
