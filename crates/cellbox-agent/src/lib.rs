//! Guest agent capability layer for cellbox.
//!
//! The [`Agent`] trait is the sandbox's only channel into the guest:
//! container lifecycle, process control, CPU/memory onlining, network
//! configuration and swap registration all go through it. The concrete
//! transport lives outside this workspace; [`NoopAgent`] stands in when no
//! agent is configured and in tests.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod error;
pub mod noop;
pub mod traits;
pub mod types;

pub use error::{AgentError, Result};
pub use noop::NoopAgent;
pub use traits::Agent;
pub use types::{
    CreateContainerRequest, CreateSandboxRequest, GuestDetails, GuestProcess, GuestResources,
    Interface, IpAddress, Route, Storage,
};
