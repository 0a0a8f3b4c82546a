//! Machine data models.

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};

use crate::config::PortBases;

use super::allocator;

/// Length of generated instance credentials.
const SECRET_LEN: usize = 12;

/// Machine flavor. Each kind maps to a distinct base image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineKind {
    /// Minimal image (ssh + ftp + nginx).
    #[default]
    Base,
    /// Base plus a PHP runtime.
    Php,
    /// Base plus a Python runtime.
    Python,
}

impl MachineKind {
    /// Image name for this kind.
    pub fn image(&self) -> String {
        format!("dotmachine-{}", self)
    }

    /// Dockerfile name for this kind within the build context.
    pub fn dockerfile(&self) -> String {
        format!("Dockerfile.{}", self)
    }
}

impl std::fmt::Display for MachineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MachineKind::Base => write!(f, "base"),
            MachineKind::Php => write!(f, "php"),
            MachineKind::Python => write!(f, "python"),
        }
    }
}

impl std::str::FromStr for MachineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "base" => Ok(MachineKind::Base),
            "php" => Ok(MachineKind::Php),
            "python" => Ok(MachineKind::Python),
            _ => Err(format!("unknown machine kind: {}", s)),
        }
    }
}

/// Live machine status, derived from the runtime and never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    /// Backing instance exists but is not running.
    Stopped,
    /// Backing instance is running.
    Running,
    /// Backing instance is missing or the runtime query failed.
    Error,
}

impl std::fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MachineStatus::Stopped => write!(f, "stopped"),
            MachineStatus::Running => write!(f, "running"),
            MachineStatus::Error => write!(f, "error"),
        }
    }
}

/// Host port triple for one machine. Each port is `base + id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSet {
    pub ssh: u16,
    pub ftp: u16,
    pub http: u16,
}

/// One provisioned machine.
///
/// Ports are intentionally absent: they are always re-derived from `id`
/// so they can never drift from the identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineRecord {
    /// Unique id in `[1, max_machines]`.
    pub id: u32,
    /// Instance name, `{prefix}{id}`.
    pub name: String,
    /// Opaque identity of the owner, from the external auth layer.
    pub owner_id: String,
    /// Login user created inside the instance.
    pub login_user: String,
    /// Instance credential. Regenerated on reset; shown only at the moment
    /// of creation or rotation, never logged.
    pub secret: String,
    /// Machine flavor.
    #[serde(default)]
    pub kind: MachineKind,
    /// Domains served by the instance, in insertion order, duplicate-free.
    #[serde(default)]
    pub sites: Vec<String>,
    /// Creation time (UTC).
    pub created_at: DateTime<Utc>,
    /// Lease expiry (UTC).
    pub expires_at: DateTime<Utc>,
}

impl MachineRecord {
    /// Derived host port triple for this record's current id.
    pub fn ports(&self, bases: PortBases) -> PortSet {
        allocator::derive_ports(bases, self.id)
    }

    /// Whether the lease has expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    /// Sanitized view for display. The credential never leaves the record.
    pub fn view(&self, bases: PortBases) -> MachineView {
        MachineView {
            id: self.id,
            name: self.name.clone(),
            owner_id: self.owner_id.clone(),
            login_user: self.login_user.clone(),
            kind: self.kind,
            ports: self.ports(bases),
            sites: self.sites.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
        }
    }
}

/// Display view of a machine. Carries the derived ports and omits the
/// credential entirely.
#[derive(Debug, Clone, Serialize)]
pub struct MachineView {
    pub id: u32,
    pub name: String,
    pub owner_id: String,
    pub login_user: String,
    pub kind: MachineKind,
    pub ports: PortSet,
    pub sites: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl MachineView {
    /// Whole days remaining on the lease (negative once expired).
    pub fn remaining_days(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_days()
    }
}

/// Generate a fresh instance credential (alphanumeric, fixed length).
pub fn generate_secret() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(SECRET_LEN)
        .map(char::from)
        .collect()
}
