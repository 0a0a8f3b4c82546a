//! Fleet lifecycle orchestration.
//!
//! Create, remove (with id compaction), reset, renew, site management,
//! power control, and the expiry reaper.

pub mod domain;
mod reaper;
mod service;

pub use reaper::ExpiryReaper;
pub use service::{LifecycleManager, PowerAction, StatusProbe};
