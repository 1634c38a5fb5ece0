//! Lifecycle state machines for sandboxes and containers.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Lifecycle state of a sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    /// Created, VM not started.
    #[default]
    Ready,
    /// VM up, agent reachable.
    Running,
    /// vCPUs paused.
    Paused,
    /// VM down.
    Stopped,
}

impl SandboxState {
    /// Whether moving to `to` is a legal transition.
    #[must_use]
    pub const fn can_transition(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Ready | Self::Paused | Self::Stopped, Self::Running)
                | (Self::Ready | Self::Running | Self::Paused, Self::Stopped)
                | (Self::Running, Self::Paused)
        )
    }

    /// Whether a sandbox in this state may be deleted. Deletion is not a
    /// transition; a running sandbox must be stopped first.
    #[must_use]
    pub const fn can_delete(self) -> bool {
        matches!(self, Self::Ready | Self::Paused | Self::Stopped)
    }

    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validates a sandbox transition, naming the offender on failure.
pub fn validate_sandbox_transition(id: &str, from: SandboxState, to: SandboxState) -> Result<()> {
    if from.can_transition(to) {
        Ok(())
    } else {
        Err(CoreError::InvalidStateTransition {
            object: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Lifecycle state of a container. Same shape as the sandbox machine; the
/// container one is driven only through its owning sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// Created in the guest, init process not started.
    #[default]
    Ready,
    /// Init process running.
    Running,
    /// Frozen with the sandbox.
    Paused,
    /// Init process exited or killed.
    Stopped,
}

impl ContainerState {
    /// Whether moving to `to` is a legal transition.
    #[must_use]
    pub const fn can_transition(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Ready | Self::Paused | Self::Stopped, Self::Running)
                | (Self::Ready | Self::Running | Self::Paused, Self::Stopped)
                | (Self::Running, Self::Paused)
        )
    }

    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validates a container transition.
pub fn validate_container_transition(
    id: &str,
    from: ContainerState,
    to: ContainerState,
) -> Result<()> {
    if from.can_transition(to) {
        Ok(())
    } else {
        Err(CoreError::InvalidStateTransition {
            object: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Sandbox-level runtime facts that must survive a runtime restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxStateInfo {
    /// Lifecycle state.
    pub state: SandboxState,
    /// Block indices currently handed out to drives.
    pub block_index_set: BTreeSet<u32>,
    /// Guest memory hotplug granularity, MiB. Zero until queried.
    pub guest_memory_block_size_mb: u32,
    /// Guest supports probe-based memory onlining.
    pub guest_memory_hotplug_probe: bool,
}
