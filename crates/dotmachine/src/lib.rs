//! DotMachine Fleet Control Plane
//!
//! This library provides the core components for managing a fleet of
//! short-lived, per-user sandboxed machines on a single host: identifier
//! and port allocation with compaction, the ownership- and capacity-gated
//! lifecycle manager, the expiry reaper, and the per-owner session
//! multiplexer (status feed + terminal bridge).

pub mod config;
pub mod error;
#[cfg(test)]
mod testing;
pub mod fleet;
pub mod machine;
pub mod runtime;
pub mod session;
pub mod ws;

pub use config::{FleetConfig, PortBases, ResourceLimits};
pub use error::{FleetError, FleetResult};
pub use fleet::{ExpiryReaper, LifecycleManager, PowerAction, StatusProbe};
pub use machine::{
    MachineKind, MachineRecord, MachineStatus, MachineView, PortSet, Registry, RegistryStore,
};
pub use runtime::{ContainerRuntime, DockerCli, ImageStore, RuntimeError, RuntimeResult};
pub use session::{BridgeState, SessionMultiplexer};
pub use ws::{FleetEvent, OwnerHub};
