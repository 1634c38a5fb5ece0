//! Container data. All behavior is driven through the owning sandbox; a
//! container never talks to the hypervisor or the agent on its own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ContainerConfig;
use crate::error::Result;
use crate::persist::ContainerDiskState;
use crate::state::{validate_container_transition, ContainerState};

/// A process started in the guest, the container init or an exec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    /// Guest-side exec identifier.
    pub exec_id: String,
    /// When the process was started, host clock.
    pub start_time: DateTime<Utc>,
}

/// One container of a sandbox.
#[derive(Debug, Clone)]
pub struct Container {
    pub(crate) config: ContainerConfig,
    pub(crate) state: ContainerState,
    pub(crate) process: Option<Process>,
    /// Devices this container references, by manager ID.
    pub(crate) device_ids: Vec<String>,
    /// Manager ID of the drive backing a block rootfs.
    pub(crate) block_device_id: Option<String>,
}

impl Container {
    pub(crate) fn new(config: ContainerConfig) -> Self {
        Self {
            config,
            state: ContainerState::Ready,
            process: None,
            device_ids: Vec::new(),
            block_device_id: None,
        }
    }

    pub(crate) fn from_disk(state: ContainerDiskState) -> Self {
        Self {
            config: state.config,
            state: state.state,
            process: state.process,
            device_ids: state.device_ids,
            block_device_id: state.block_device_id,
        }
    }

    pub(crate) fn to_disk(&self) -> ContainerDiskState {
        ContainerDiskState {
            id: self.config.id.clone(),
            state: self.state,
            process: self.process.clone(),
            device_ids: self.device_ids.clone(),
            block_device_id: self.block_device_id.clone(),
            config: self.config.clone(),
        }
    }

    /// Container ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ContainerState {
        self.state
    }

    /// Init process, if started.
    #[must_use]
    pub const fn process(&self) -> Option<&Process> {
        self.process.as_ref()
    }

    /// Configuration the container was created with.
    #[must_use]
    pub const fn config(&self) -> &ContainerConfig {
        &self.config
    }

    pub(crate) fn set_state(&mut self, to: ContainerState) -> Result<()> {
        validate_container_transition(self.id(), self.state, to)?;
        self.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;

    #[test]
    fn state_changes_are_validated() {
        let mut c = Container::new(ContainerConfig {
            id: "c1".into(),
            ..ContainerConfig::default()
        });
        assert_eq!(c.state(), ContainerState::Ready);
        c.set_state(ContainerState::Running).unwrap();
        c.set_state(ContainerState::Paused).unwrap();
        c.set_state(ContainerState::Running).unwrap();
        c.set_state(ContainerState::Stopped).unwrap();

        let err = c.set_state(ContainerState::Paused).unwrap_err();
        assert!(matches!(err, CoreError::InvalidStateTransition { .. }));
    }

    #[test]
    fn disk_round_trip_keeps_devices() {
        let mut c = Container::new(ContainerConfig {
            id: "c1".into(),
            ..ContainerConfig::default()
        });
        c.device_ids.push("dead0000beef0000".into());
        c.block_device_id = Some("dead0000beef0000".into());
        c.set_state(ContainerState::Running).unwrap();

        let restored = Container::from_disk(c.to_disk());
        assert_eq!(restored.id(), "c1");
        assert_eq!(restored.state(), ContainerState::Running);
        assert_eq!(restored.device_ids, vec!["dead0000beef0000".to_string()]);
        assert_eq!(restored.block_device_id.as_deref(), Some("dead0000beef0000"));
    }
}
