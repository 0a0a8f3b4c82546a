//! Machine records and the durable registry.
//!
//! Pure data access only; nothing in this module talks to the container
//! runtime.

pub mod allocator;
mod models;
mod registry;

pub use models::{
    MachineKind, MachineRecord, MachineStatus, MachineView, PortSet, generate_secret,
};
pub use registry::{Registry, RegistryStore};
