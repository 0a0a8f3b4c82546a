//! Durable machine registry.
//!
//! The registry is a single structured document, loaded and saved
//! wholesale. Callers must treat load-mutate-save as one critical section;
//! `RegistryStore` enforces that with a single async mutex around the
//! document.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};

use crate::error::FleetResult;

use super::models::MachineRecord;

/// The whole registry document.
///
/// Field names match the operational `containers.json` format consumed by
/// external tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registry {
    /// Machine records keyed by id.
    #[serde(rename = "containers")]
    pub machines: BTreeMap<u32, MachineRecord>,
    /// Allocation cursor, kept at `max(id) + 1`.
    pub next_id: u32,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            machines: BTreeMap::new(),
            next_id: 1,
        }
    }
}

impl Registry {
    /// Record owned by the given identity, if any. At most one exists.
    pub fn find_by_owner(&self, owner_id: &str) -> Option<&MachineRecord> {
        self.machines.values().find(|r| r.owner_id == owner_id)
    }

    /// Number of provisioned machines.
    pub fn count(&self) -> usize {
        self.machines.len()
    }

    /// Re-derive the allocation cursor from the occupied ids.
    pub fn sync_next_id(&mut self) {
        self.next_id = self.machines.keys().max().copied().unwrap_or(0) + 1;
    }
}

/// Store wrapping the registry document with its on-disk location.
///
/// All mutation flows through `lock()` + `persist()`, so no two mutating
/// operations can interleave their read-modify-write sequences.
pub struct RegistryStore {
    path: PathBuf,
    doc: Mutex<Registry>,
}

impl RegistryStore {
    /// Open the store, loading the document if it exists.
    pub fn open(path: impl Into<PathBuf>) -> FleetResult<Self> {
        let path = path.into();
        let doc = if path.exists() {
            load(&path)?
        } else {
            Registry::default()
        };
        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    /// Acquire the document for a read-modify-write sequence.
    pub async fn lock(&self) -> MutexGuard<'_, Registry> {
        self.doc.lock().await
    }

    /// Clone of the current document.
    pub async fn snapshot(&self) -> Registry {
        self.doc.lock().await.clone()
    }

    /// Write the document to disk. Callers pass the guard they hold so a
    /// save can never race another mutation.
    pub fn persist(&self, registry: &Registry) -> FleetResult<()> {
        save(&self.path, registry)
    }
}

/// Load a registry document from disk.
pub fn load(path: &Path) -> FleetResult<Registry> {
    let bytes = std::fs::read(path)?;
    let mut registry: Registry = serde_json::from_slice(&bytes)?;
    // Tolerate documents written before a crash mid-compaction.
    if registry.next_id <= registry.machines.keys().max().copied().unwrap_or(0) {
        warn!(
            "registry cursor {} behind occupied ids, re-deriving",
            registry.next_id
        );
        registry.sync_next_id();
    }
    Ok(registry)
}

/// Save a registry document atomically (temp file + rename).
pub fn save(path: &Path, registry: &Registry) -> FleetResult<()> {
    let json = serde_json::to_vec_pretty(registry)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
