//! Event types pushed over the owner channel.

use serde::Serialize;

use crate::machine::MachineStatus;

/// Topic for a machine's status feed.
pub fn status_topic(machine_id: u32) -> String {
    format!("status:{}", machine_id)
}

/// Topic for a machine's terminal stream.
pub fn terminal_topic(machine_id: u32) -> String {
    format!("terminal:{}", machine_id)
}

/// Events pushed from the control plane to an owner's connections.
///
/// All events carry the machine id so consumers can multiplex several
/// machines over a single connection.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FleetEvent {
    /// Periodic live status snapshot.
    StatusSnapshot {
        machine_id: u32,
        status: MachineStatus,
        cpu_percent: f64,
        mem_used: u64,
        mem_limit: u64,
        disk_used: u64,
        disk_limit: u64,
    },

    /// Terminal bridge is up and forwarding.
    TerminalConnected { machine_id: u32 },

    /// Bytes produced by the shell, lossily decoded.
    TerminalOutput { machine_id: u32, data: String },

    /// Terminal bridge torn down.
    TerminalClosed { machine_id: u32, reason: String },

    /// Session-level error.
    Error { machine_id: u32, message: String },
}
