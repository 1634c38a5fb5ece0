//! Error types for the core layer.

use thiserror::Error;
use tracing::warn;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur in sandbox and container operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed sandbox or container configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The requested lifecycle transition is not allowed.
    #[error("invalid state transition of {object}: {from} -> {to}")]
    InvalidStateTransition {
        /// Sandbox or container ID.
        object: String,
        /// Current state.
        from: String,
        /// Requested state.
        to: String,
    },

    /// Sandbox, container or process not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// An object with this ID already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The resource is still in use.
    #[error("resource busy: {0}")]
    ResourceBusy(String),

    /// The operation needs the named object to be running.
    #[error("{0} is not running")]
    NotRunning(String),

    /// Swap file preparation failed.
    #[error("swap setup failed: {0}")]
    Swap(String),

    /// Hypervisor error.
    #[error("hypervisor error: {0}")]
    Hypervisor(#[from] cellbox_hypervisor::HypervisorError),

    /// Agent error.
    #[error("agent error: {0}")]
    Agent(#[from] cellbox_agent::AgentError),

    /// Device error.
    #[error("device error: {0}")]
    Device(#[from] cellbox_device::DeviceError),

    /// Persisted state could not be encoded or decoded.
    #[error("persist codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Teardown helper: in force mode a failed step is logged and swallowed so
/// the remaining steps still run; otherwise it aborts the teardown.
pub fn or_force(res: Result<()>, force: bool, op: &str) -> Result<()> {
    match res {
        Ok(()) => Ok(()),
        Err(e) if force => {
            warn!(step = op, error = %e, "ignoring teardown failure in force mode");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn force_mode_swallows_failures() {
        let failing = || Err(CoreError::NotRunning("sb".into()));
        assert!(or_force(failing(), true, "stop").is_ok());
        assert!(or_force(failing(), false, "stop").is_err());
        assert!(or_force(Ok(()), false, "stop").is_ok());
    }
}
