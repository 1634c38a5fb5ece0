//! Device model for cellbox sandboxes.
//!
//! A [`DeviceManager`] owns every device one sandbox knows about: it
//! deduplicates by host major/minor, hands out random hex IDs, and tracks
//! two counters per device (how many containers reference it, and how many
//! times it is attached to the VM). The devices themselves are a tagged
//! [`Device`] enum; attach and detach run through the [`DeviceReceiver`]
//! callbacks the sandbox implements, so this crate never talks to a
//! hypervisor directly.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod drivers;
pub mod error;
pub mod manager;

pub use config::{BlockDrive, DeviceInfo, DeviceType, PciPath, VfioDev, VhostUserDeviceAttrs};
pub use drivers::{Device, DeviceReceiver};
pub use error::{DeviceError, Result};
pub use manager::{DeviceManager, DeviceState};
