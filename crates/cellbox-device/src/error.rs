//! Error types for the device layer.

use thiserror::Error;

/// Result type alias for device operations.
pub type Result<T> = std::result::Result<T, DeviceError>;

/// Errors that can occur in device operations.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Random ID generation kept colliding with existing devices.
    #[error("device IDs are exhausted")]
    IdsExhausted,

    /// Device with the specified ID has not been created.
    #[error("device not found: {0}")]
    NotFound(String),

    /// Device is not attached to the sandbox.
    #[error("device not attached: {0}")]
    NotAttached(String),

    /// Device is still attached and cannot be removed from the manager.
    #[error("device busy: {0}")]
    Busy(String),

    /// Operation is not supported for this device kind.
    #[error("unsupported device operation: {0}")]
    Unsupported(String),

    /// Malformed device description.
    #[error("invalid device configuration: {0}")]
    InvalidConfig(String),

    /// Failure reported by the device receiver (hypervisor or cgroup side).
    #[error("device receiver error: {0}")]
    Receiver(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
