//! Per-owner concurrent sessions: status feeds and terminal bridges.
//!
//! Sessions are keyed by `(machine_id, owner_id)` and owned by an explicit
//! [`SessionMultiplexer`] table rather than ambient globals. Starting a
//! session for a key supersedes any previous one, so at most one loop or
//! bridge is ever live per key.

mod status;
mod terminal;

pub use terminal::BridgeState;

use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use dashmap::DashMap;

use crate::error::{FleetError, FleetResult};
use crate::fleet::LifecycleManager;
use crate::runtime::RuntimeError;
use crate::ws::OwnerHub;

/// Session identity: one machine as seen by one owner.
pub type SessionKey = (u32, String);

/// Concurrent session multiplexer.
pub struct SessionMultiplexer {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) manager: Arc<LifecycleManager>,
    pub(crate) hub: Arc<OwnerHub>,
    pub(crate) status_loops: DashMap<SessionKey, status::StatusHandle>,
    pub(crate) terminals: DashMap<SessionKey, terminal::TerminalBridge>,
    /// Monotonic generation counter; lets a finished task remove its own
    /// table entry without clobbering a superseding session.
    pub(crate) generation: AtomicU64,
}

impl SessionMultiplexer {
    pub fn new(manager: Arc<LifecycleManager>, hub: Arc<OwnerHub>) -> Self {
        Self {
            inner: Arc::new(Inner {
                manager,
                hub,
                status_loops: DashMap::new(),
                terminals: DashMap::new(),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Start (or restart) the status feed for a machine.
    ///
    /// The loop re-validates ownership every cycle and stops on its own
    /// when the record disappears, the owner changes, or the owner's
    /// transport goes away.
    pub async fn watch_status(&self, owner_id: &str, machine_id: u32) -> FleetResult<()> {
        status::watch(&self.inner, owner_id, machine_id).await
    }

    /// Stop the status feed for a machine.
    pub async fn unwatch_status(&self, owner_id: &str, machine_id: u32) {
        let key = (machine_id, owner_id.to_string());
        if let Some((_, handle)) = self.inner.status_loops.remove(&key) {
            handle.shutdown().await;
        }
    }

    /// Open a terminal bridge to a machine at the given geometry. A second
    /// connect for the same key supersedes the first bridge.
    pub async fn connect_terminal(
        &self,
        owner_id: &str,
        machine_id: u32,
        rows: u16,
        cols: u16,
    ) -> FleetResult<()> {
        terminal::connect(&self.inner, owner_id, machine_id, rows, cols).await
    }

    /// Forward client keystrokes to the machine's shell.
    pub async fn terminal_input(
        &self,
        owner_id: &str,
        machine_id: u32,
        data: &[u8],
    ) -> FleetResult<()> {
        self.inner.manager.authorize(owner_id, machine_id).await?;
        let key = (machine_id, owner_id.to_string());
        match self.inner.terminals.get(&key) {
            Some(bridge) => bridge.write_input(data),
            None => Err(no_bridge(machine_id)),
        }
    }

    /// Update the terminal geometry in place.
    pub async fn resize_terminal(
        &self,
        owner_id: &str,
        machine_id: u32,
        rows: u16,
        cols: u16,
    ) -> FleetResult<()> {
        self.inner.manager.authorize(owner_id, machine_id).await?;
        let key = (machine_id, owner_id.to_string());
        match self.inner.terminals.get(&key) {
            Some(bridge) => bridge.resize(rows, cols),
            None => Err(no_bridge(machine_id)),
        }
    }

    /// Tear down the terminal bridge for a machine, if one is up.
    pub async fn disconnect_terminal(&self, owner_id: &str, machine_id: u32) {
        terminal::disconnect(&self.inner, owner_id, machine_id).await;
    }

    /// Current bridge state for a machine, if a bridge exists.
    pub fn terminal_state(&self, owner_id: &str, machine_id: u32) -> Option<BridgeState> {
        let key = (machine_id, owner_id.to_string());
        self.inner.terminals.get(&key).map(|b| b.state())
    }

    /// Stop every session.
    pub async fn shutdown(&self) {
        let keys: Vec<SessionKey> = self
            .inner
            .status_loops
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for key in keys {
            if let Some((_, handle)) = self.inner.status_loops.remove(&key) {
                handle.shutdown().await;
            }
        }

        let keys: Vec<SessionKey> = self
            .inner
            .terminals
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for key in keys {
            if let Some((_, bridge)) = self.inner.terminals.remove(&key) {
                bridge.shutdown().await;
            }
        }
    }

    /// Number of live status loops (observability / tests).
    pub fn active_status_loops(&self) -> usize {
        self.inner.status_loops.len()
    }

    /// Number of live terminal bridges (observability / tests).
    pub fn active_terminals(&self) -> usize {
        self.inner.terminals.len()
    }
}

fn no_bridge(machine_id: u32) -> FleetError {
    FleetError::Runtime(RuntimeError::Terminal(format!(
        "no active terminal bridge for machine {}",
        machine_id
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MachineKind;
    use crate::testing::fixture;
    use crate::ws::{Envelope, FleetEvent};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    async fn next_event(rx: &mut mpsc::Receiver<Envelope>) -> Envelope {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("hub channel closed")
    }

    /// Receive events until one matches, panicking after a timeout.
    async fn wait_for(
        rx: &mut mpsc::Receiver<Envelope>,
        mut pred: impl FnMut(&FleetEvent) -> bool,
    ) -> FleetEvent {
        loop {
            let envelope = next_event(rx).await;
            if pred(&envelope.event) {
                return envelope.event;
            }
        }
    }

    #[tokio::test]
    async fn test_status_loop_pushes_snapshots() {
        let f = fixture(30);
        f.manager.create("owner-a", "alice", MachineKind::Base).await.unwrap();
        let (mut rx, _) = f.hub.register_connection("owner-a");

        let mux = SessionMultiplexer::new(f.manager.clone(), f.hub.clone());
        mux.watch_status("owner-a", 1).await.unwrap();

        let event = wait_for(&mut rx, |e| matches!(e, FleetEvent::StatusSnapshot { .. })).await;
        match event {
            FleetEvent::StatusSnapshot {
                machine_id, status, ..
            } => {
                assert_eq!(machine_id, 1);
                assert_eq!(status, crate::machine::MachineStatus::Running);
            }
            _ => unreachable!(),
        }

        mux.unwatch_status("owner-a", 1).await;
        assert_eq!(mux.active_status_loops(), 0);
    }

    #[tokio::test]
    async fn test_status_loop_requires_ownership() {
        let f = fixture(30);
        f.manager.create("owner-a", "alice", MachineKind::Base).await.unwrap();

        let mux = SessionMultiplexer::new(f.manager.clone(), f.hub.clone());
        assert!(mux.watch_status("owner-b", 1).await.is_err());
        assert!(mux.watch_status("owner-a", 99).await.is_err());
        assert_eq!(mux.active_status_loops(), 0);
    }

    #[tokio::test]
    async fn test_status_loop_terminates_after_record_deleted() {
        let f = fixture(30);
        f.manager.create("owner-a", "alice", MachineKind::Base).await.unwrap();
        let (mut rx, _) = f.hub.register_connection("owner-a");

        let mux = SessionMultiplexer::new(f.manager.clone(), f.hub.clone());
        mux.watch_status("owner-a", 1).await.unwrap();
        wait_for(&mut rx, |e| matches!(e, FleetEvent::StatusSnapshot { .. })).await;

        f.manager.remove("owner-a", 1).await.unwrap();

        // Give the loop a few cycles to notice, then drain whatever was
        // already in flight.
        tokio::time::sleep(Duration::from_millis(150)).await;
        while rx.try_recv().is_ok() {}

        // No further pushes arrive and the loop has deregistered itself.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(mux.active_status_loops(), 0);
    }

    #[tokio::test]
    async fn test_second_watch_supersedes_first() {
        let f = fixture(30);
        f.manager.create("owner-a", "alice", MachineKind::Base).await.unwrap();
        let (_rx, _) = f.hub.register_connection("owner-a");

        let mux = SessionMultiplexer::new(f.manager.clone(), f.hub.clone());
        mux.watch_status("owner-a", 1).await.unwrap();
        mux.watch_status("owner-a", 1).await.unwrap();
        assert_eq!(mux.active_status_loops(), 1);

        mux.unwatch_status("owner-a", 1).await;
        assert_eq!(mux.active_status_loops(), 0);
    }

    #[tokio::test]
    async fn test_terminal_bridge_round_trip() {
        let f = fixture(30);
        f.manager.create("owner-a", "alice", MachineKind::Base).await.unwrap();
        let (mut rx, _) = f.hub.register_connection("owner-a");

        let mux = SessionMultiplexer::new(f.manager.clone(), f.hub.clone());
        mux.connect_terminal("owner-a", 1, 40, 120).await.unwrap();
        assert_eq!(mux.active_terminals(), 1);
        assert_eq!(
            mux.terminal_state("owner-a", 1),
            Some(BridgeState::Active)
        );
        wait_for(&mut rx, |e| matches!(e, FleetEvent::TerminalConnected { .. })).await;

        // The fake runtime bridges to /bin/cat, so input comes back out.
        mux.terminal_input("owner-a", 1, b"hello\n").await.unwrap();
        let event = wait_for(&mut rx, |e| {
            matches!(e, FleetEvent::TerminalOutput { data, .. } if data.contains("hello"))
        })
        .await;
        assert!(matches!(event, FleetEvent::TerminalOutput { .. }));

        mux.resize_terminal("owner-a", 1, 50, 132).await.unwrap();

        mux.disconnect_terminal("owner-a", 1).await;
        assert_eq!(mux.active_terminals(), 0);
        wait_for(&mut rx, |e| matches!(e, FleetEvent::TerminalClosed { .. })).await;
    }

    #[tokio::test]
    async fn test_second_connect_supersedes_first_bridge() {
        let f = fixture(30);
        f.manager.create("owner-a", "alice", MachineKind::Base).await.unwrap();
        let (mut rx, _) = f.hub.register_connection("owner-a");

        let mux = SessionMultiplexer::new(f.manager.clone(), f.hub.clone());
        mux.connect_terminal("owner-a", 1, 40, 120).await.unwrap();
        wait_for(&mut rx, |e| matches!(e, FleetEvent::TerminalConnected { .. })).await;

        mux.connect_terminal("owner-a", 1, 40, 120).await.unwrap();
        assert_eq!(mux.active_terminals(), 1);

        // The old bridge announced its closure before the new one came up.
        wait_for(&mut rx, |e| {
            matches!(e, FleetEvent::TerminalClosed { reason, .. } if reason == "superseded")
        })
        .await;
        wait_for(&mut rx, |e| matches!(e, FleetEvent::TerminalConnected { .. })).await;

        mux.disconnect_terminal("owner-a", 1).await;
        assert_eq!(mux.active_terminals(), 0);
    }

    #[tokio::test]
    async fn test_terminal_connect_fails_closed() {
        let f = fixture(30);
        f.manager.create("owner-a", "alice", MachineKind::Base).await.unwrap();
        let (mut rx, _) = f.hub.register_connection("owner-b");

        let mux = SessionMultiplexer::new(f.manager.clone(), f.hub.clone());
        assert!(mux.connect_terminal("owner-b", 1, 40, 120).await.is_err());
        assert_eq!(mux.active_terminals(), 0);

        // The rejected owner got an error signal on their own channel.
        wait_for(&mut rx, |e| matches!(e, FleetEvent::Error { .. })).await;

        // Input without a bridge is rejected too.
        assert!(mux.terminal_input("owner-a", 1, b"x").await.is_err());
    }
}
