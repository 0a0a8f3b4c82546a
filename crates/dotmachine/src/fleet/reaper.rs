//! Expiry reaper - reclaims machines whose lease has run out.
//!
//! Runs out-of-band with system authority; the ownership check is the only
//! part of the removal path it skips.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{error, info, warn};

use crate::error::FleetError;

use super::service::LifecycleManager;

/// Periodic sweep deleting machines past their expiry.
pub struct ExpiryReaper {
    manager: Arc<LifecycleManager>,
}

impl ExpiryReaper {
    pub fn new(manager: Arc<LifecycleManager>) -> Self {
        Self { manager }
    }

    /// Remove every expired machine. Returns the number reclaimed.
    ///
    /// One machine's failure never aborts the sweep for the others, and
    /// re-running against the same registry is a no-op once a record is
    /// gone. Targets are re-selected from a fresh snapshot after each
    /// removal because compaction renumbers the survivors.
    pub async fn sweep(&self) -> usize {
        let now = Utc::now();
        let mut removed = 0usize;
        let mut skipped: HashSet<String> = HashSet::new();

        loop {
            let target = {
                let registry = self.manager.store().lock().await;
                registry
                    .machines
                    .values()
                    .filter(|r| r.is_expired(now) && !skipped.contains(&r.owner_id))
                    .map(|r| (r.id, r.owner_id.clone(), r.name.clone()))
                    .min_by_key(|(id, _, _)| *id)
            };
            let Some((id, owner_id, name)) = target else {
                break;
            };

            match self.manager.remove_unchecked(id).await {
                Ok(()) => {
                    info!("reaped expired machine {} ({})", id, name);
                    removed += 1;
                }
                // The record is gone; only the renumbering behind it
                // stalled, which the next removal will retry.
                Err(FleetError::CompactionFailed {
                    shifted, failed_id, ..
                }) => {
                    warn!(
                        "reaped machine {} but compaction stalled at {} after {} shift(s)",
                        id, failed_id, shifted
                    );
                    removed += 1;
                }
                Err(err) => {
                    error!("failed to reap machine {}: {}", id, err);
                    skipped.insert(owner_id);
                }
            }
        }

        if removed > 0 {
            info!("reaped {} expired machine(s)", removed);
        }
        removed
    }

    /// Start the recurring sweep task.
    ///
    /// Returns a handle that can be used to stop the task.
    pub fn start(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        info!("starting expiry reaper (sweep every {:?})", interval);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.sweep().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MachineKind;
    use crate::testing::fixture;
    use chrono::Duration as ChronoDuration;

    #[tokio::test]
    async fn test_sweep_removes_only_expired() {
        let f = fixture(30);
        f.manager.create("owner-a", "alice", MachineKind::Base).await.unwrap();
        f.manager.create("owner-b", "bob", MachineKind::Base).await.unwrap();

        {
            let mut registry = f.manager.store().lock().await;
            registry.machines.get_mut(&1).unwrap().expires_at =
                Utc::now() - ChronoDuration::hours(1);
        }

        let reaper = ExpiryReaper::new(f.manager.clone());
        assert_eq!(reaper.sweep().await, 1);

        // owner-b's machine survived and was compacted down to id 1.
        let registry = f.manager.store().snapshot().await;
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.machines[&1].owner_id, "owner-b");

        // Idempotent: a second sweep with nothing expired is a no-op.
        assert_eq!(reaper.sweep().await, 0);
    }

    #[tokio::test]
    async fn test_sweep_continues_past_failures() {
        let f = fixture(30);
        f.manager.create("owner-a", "alice", MachineKind::Base).await.unwrap();
        f.manager.create("owner-b", "bob", MachineKind::Base).await.unwrap();
        f.manager.create("owner-c", "carol", MachineKind::Base).await.unwrap();

        {
            let mut registry = f.manager.store().lock().await;
            for id in [1, 2, 3] {
                registry.machines.get_mut(&id).unwrap().expires_at =
                    Utc::now() - ChronoDuration::hours(1);
            }
        }
        // Machine 2's stop fails during compaction of machine 1's removal;
        // the sweep still drains everything because removal itself treats
        // teardown as best-effort.
        f.runtime
            .fail_stop_names
            .lock()
            .unwrap()
            .insert("dotmachine-2".to_string());

        let reaper = ExpiryReaper::new(f.manager.clone());
        let removed = reaper.sweep().await;
        assert_eq!(removed, 3);

        let registry = f.manager.store().snapshot().await;
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_start_returns_running_task() {
        let f = fixture(30);
        let reaper = Arc::new(ExpiryReaper::new(f.manager.clone()));
        let handle = reaper.start(Duration::from_secs(3600));
        assert!(!handle.is_finished());
        handle.abort();
    }
}
