//! Error types for the agent layer.

use thiserror::Error;

/// Result type alias for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors that can occur talking to the guest agent.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The agent channel is not connected.
    #[error("agent is not connected")]
    NotConnected,

    /// The guest rejected or failed the request.
    #[error("agent request failed: {0}")]
    Request(String),

    /// The guest does not know the referenced container or process.
    #[error("agent: not found: {0}")]
    NotFound(String),

    /// The request timed out.
    #[error("agent request timed out: {0}")]
    Timeout(String),

    /// I/O error on the agent channel.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
