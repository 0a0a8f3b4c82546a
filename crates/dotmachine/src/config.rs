//! Fleet configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Prefix used for instance names managed by this control plane.
const MACHINE_NAME_PREFIX: &str = "dotmachine-";

/// Prefix for instance login user names.
const LOGIN_USER_PREFIX: &str = "dotm-";

/// Default capacity ceiling for the whole fleet.
const DEFAULT_MAX_MACHINES: u32 = 30;

/// Default lease length granted at creation and per renewal.
const DEFAULT_LEASE_DAYS: i64 = 5;

const DEFAULT_BASE_HTTP_PORT: u16 = 5000;
const DEFAULT_BASE_SSH_PORT: u16 = 5100;
const DEFAULT_BASE_FTP_PORT: u16 = 5200;

/// Port base offsets per protocol. The host port for a machine is always
/// `base + id`, so the triple is a pure function of the machine id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBases {
    pub ssh: u16,
    pub ftp: u16,
    pub http: u16,
}

impl Default for PortBases {
    fn default() -> Self {
        Self {
            ssh: DEFAULT_BASE_SSH_PORT,
            ftp: DEFAULT_BASE_FTP_PORT,
            http: DEFAULT_BASE_HTTP_PORT,
        }
    }
}

/// Resource limits applied to every instance at creation, passed through
/// verbatim to the container runtime.
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    /// CPU scheduler period in microseconds.
    pub cpu_period: u64,
    /// CPU quota within one period, in microseconds (3_000 = 0.03 CPU).
    pub cpu_quota: u64,
    /// Memory ceiling in megabytes.
    pub memory_mb: f64,
    /// Storage ceiling (runtime size string, e.g. "3G").
    pub storage: String,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_period: 100_000,
            cpu_quota: 3_000,
            memory_mb: 51.2,
            storage: "3G".to_string(),
        }
    }
}

/// Fleet configuration.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Maximum number of machines on this host.
    pub max_machines: u32,
    /// Lease length in days granted at creation and per renewal.
    pub lease_days: i64,
    /// Port base offsets per protocol.
    pub port_bases: PortBases,
    /// Prefix for derived instance names (`{prefix}{id}`).
    pub name_prefix: String,
    /// Prefix for instance login user names.
    pub login_prefix: String,
    /// Base directory for per-machine persistent data (`{data_dir}/{id}`).
    pub data_dir: PathBuf,
    /// Build context directory containing the per-kind Dockerfiles.
    pub build_context: PathBuf,
    /// Path of the registry document.
    pub registry_path: PathBuf,
    /// Resource limits applied at creation.
    pub limits: ResourceLimits,
    /// Interval between status snapshots pushed to a subscribed owner.
    pub status_interval: Duration,
    /// Interval between expiry reaper sweeps.
    pub reap_interval: Duration,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            max_machines: DEFAULT_MAX_MACHINES,
            lease_days: DEFAULT_LEASE_DAYS,
            port_bases: PortBases::default(),
            name_prefix: MACHINE_NAME_PREFIX.to_string(),
            login_prefix: LOGIN_USER_PREFIX.to_string(),
            data_dir: PathBuf::from("./data/containers"),
            build_context: PathBuf::from("."),
            registry_path: PathBuf::from("containers.json"),
            limits: ResourceLimits::default(),
            status_interval: Duration::from_secs(3),
            reap_interval: Duration::from_secs(15 * 60),
        }
    }
}

impl FleetConfig {
    /// Persistent data directory for a machine id.
    pub fn machine_data_dir(&self, id: u32) -> PathBuf {
        self.data_dir.join(id.to_string())
    }
}
