//! Error types for the hypervisor layer.

use thiserror::Error;

/// Result type alias for hypervisor operations.
pub type Result<T> = std::result::Result<T, HypervisorError>;

/// Errors that can occur in hypervisor operations.
#[derive(Debug, Error)]
pub enum HypervisorError {
    /// The VM has not been created yet.
    #[error("VM {0} has not been created")]
    NotCreated(String),

    /// The VM is not running.
    #[error("VM {0} is not running")]
    NotRunning(String),

    /// The VM is already in the requested state.
    #[error("VM {0} is already {1}")]
    AlreadyInState(String, String),

    /// Malformed hypervisor configuration.
    #[error("invalid hypervisor configuration: {0}")]
    InvalidConfig(String),

    /// The backend does not support the requested operation.
    #[error("unsupported hypervisor operation: {0}")]
    Unsupported(String),

    /// The backend reported a failure.
    #[error("hypervisor failure: {0}")]
    Failed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
