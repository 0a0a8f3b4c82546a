//! Status-polling loop: pushes live machine snapshots to the owner.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use log::debug;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::FleetResult;
use crate::ws::{FleetEvent, status_topic};

use super::Inner;

/// How long to wait for a loop to acknowledge its stop signal before
/// aborting it outright.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Handle to one running status loop.
pub(crate) struct StatusHandle {
    pub(crate) generation: u64,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl StatusHandle {
    /// Signal the loop to stop and wait (bounded) for it to finish.
    pub(crate) async fn shutdown(self) {
        let _ = self.stop.send(true);
        let mut task = self.task;
        if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
            task.abort();
        }
    }
}

/// Start a status loop for `(machine_id, owner_id)`, superseding any
/// existing loop for the key.
pub(crate) async fn watch(inner: &Arc<Inner>, owner_id: &str, machine_id: u32) -> FleetResult<()> {
    // Validate ownership up front; the loop re-validates every cycle.
    inner.manager.authorize(owner_id, machine_id).await?;

    let key = (machine_id, owner_id.to_string());
    if let Some((_, old)) = inner.status_loops.remove(&key) {
        old.shutdown().await;
    }

    let generation = inner.generation.fetch_add(1, Ordering::Relaxed);
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<()>();

    let task = tokio::spawn({
        let inner = Arc::clone(inner);
        let owner = owner_id.to_string();
        async move {
            // Hold off until the handle is in the session table, so the
            // deregistration below can never race the insert.
            let _ = ready_rx.await;
            let mut ticker = tokio::time::interval(inner.manager.config().status_interval);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        // Ownership can lapse between ticks: the record may
                        // be deleted, or compaction may hand the id to a
                        // different tenant.
                        let view = match inner.manager.authorize(&owner, machine_id).await {
                            Ok(view) => view,
                            Err(_) => {
                                debug!("status loop for machine {} ending: ownership gone", machine_id);
                                break;
                            }
                        };

                        let probe = inner.manager.probe_status(&view.name).await;
                        let event = FleetEvent::StatusSnapshot {
                            machine_id,
                            status: probe.status,
                            cpu_percent: probe.cpu_percent,
                            mem_used: probe.mem_used,
                            mem_limit: probe.mem_limit,
                            disk_used: probe.disk_used,
                            disk_limit: probe.disk_limit,
                        };
                        if inner.hub.push(&owner, &status_topic(machine_id), event).await == 0 {
                            debug!("status loop for machine {} ending: owner transport gone", machine_id);
                            break;
                        }
                    }
                }
            }
            // Deregister, but never clobber a loop that superseded us.
            inner
                .status_loops
                .remove_if(&(machine_id, owner.clone()), |_, h| h.generation == generation);
        }
    });

    inner.status_loops.insert(
        key,
        StatusHandle {
            generation,
            stop: stop_tx,
            task,
        },
    );
    let _ = ready_tx.send(());
    Ok(())
}
