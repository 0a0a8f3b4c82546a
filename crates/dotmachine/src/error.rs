//! Typed errors for fleet operations.

use thiserror::Error;

use crate::runtime::RuntimeError;

/// Result type for fleet operations.
pub type FleetResult<T> = Result<T, FleetError>;

/// Errors surfaced by the fleet control plane.
///
/// Authorization and validation variants are rejected before any mutation
/// or runtime call; runtime failures during best-effort teardown are
/// swallowed by the caller so the registry can always be cleaned up.
#[derive(Debug, Error)]
pub enum FleetError {
    /// The machine exists but belongs to a different identity.
    #[error("machine {id} is not owned by this identity")]
    NotOwner { id: u32 },

    /// The identity already owns a machine.
    #[error("identity '{owner_id}' already owns a machine")]
    AlreadyOwned { owner_id: String },

    /// The fleet is at its capacity ceiling.
    #[error("fleet is at capacity ({max} machines)")]
    CapacityExhausted { max: u32 },

    /// The domain does not match the hostname grammar.
    #[error("invalid domain: '{0}'")]
    InvalidDomain(String),

    /// The referenced machine does not exist.
    #[error("machine {id} not found")]
    NotFound { id: u32 },

    /// An underlying instance operation failed.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// A compaction shift failed part-way; the id space is left sparse but
    /// consistent and no further shifts were attempted.
    #[error("compaction halted at machine {failed_id} after {shifted} shift(s): {reason}")]
    CompactionFailed {
        shifted: usize,
        failed_id: u32,
        reason: String,
    },

    /// I/O error while managing registry or data directories.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Registry document could not be encoded or decoded.
    #[error("registry serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
