//! Identifier allocation and derived name/port computation.
//!
//! `derive_name` and `derive_ports` are the single shared implementation
//! used everywhere a name or port is needed (registry views, provisioning,
//! session bridging). Deriving them anywhere else is a bug.

use crate::config::PortBases;
use crate::error::{FleetError, FleetResult};

use super::models::PortSet;
use super::registry::Registry;

/// Instance name for a machine id.
pub fn derive_name(prefix: &str, id: u32) -> String {
    format!("{}{}", prefix, id)
}

/// Host port triple for a machine id.
pub fn derive_ports(bases: PortBases, id: u32) -> PortSet {
    PortSet {
        ssh: bases.ssh + id as u16,
        ftp: bases.ftp + id as u16,
        http: bases.http + id as u16,
    }
}

/// Smallest unused id in `[1, max_machines]`.
///
/// The compactor keeps the id space dense, so this normally returns
/// `count + 1`; after a partial compaction it re-fills the holes.
pub fn next_id(registry: &Registry, max_machines: u32) -> FleetResult<u32> {
    (1..=max_machines)
        .find(|id| !registry.machines.contains_key(id))
        .ok_or(FleetError::CapacityExhausted { max: max_machines })
}

/// Plan the shifts required to re-densify the id space after `removed_id`
/// was freed: every record with a higher id moves down by one, in
/// ascending order so a record never lands on a still-occupied slot.
pub fn compaction_shifts(registry: &Registry, removed_id: u32) -> Vec<(u32, u32)> {
    let mut shifts: Vec<(u32, u32)> = registry
        .machines
        .keys()
        .filter(|&&id| id > removed_id)
        .map(|&id| (id, id - 1))
        .collect();
    shifts.sort_unstable();
    shifts
}
