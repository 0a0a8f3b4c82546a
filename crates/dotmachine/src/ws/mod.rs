//! Per-owner push channel.
//!
//! The transport layer (out of scope here) registers one connection per
//! open socket; the session multiplexer pushes events at it.

mod hub;
mod types;

pub use hub::{Envelope, OwnerHub, OwnerSender};
pub use types::{FleetEvent, status_topic, terminal_topic};
