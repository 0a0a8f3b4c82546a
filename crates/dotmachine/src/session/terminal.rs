//! Terminal bridge: a pseudo-terminal between the owner's client and a
//! shell inside the machine.
//!
//! PTY reads have no async form, so a dedicated blocking thread drains the
//! master side into a queue; the async forwarder multiplexes that queue
//! with the stop signal and pushes output to the owner's channel.

use std::io::{Read, Write};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::debug;
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::error::{FleetError, FleetResult};
use crate::machine::MachineView;
use crate::runtime::RuntimeError;
use crate::ws::{FleetEvent, terminal_topic};

use super::Inner;

/// Read buffer for the PTY master.
const READ_CHUNK: usize = 4096;

/// Depth of the PTY output queue between reader thread and forwarder.
const OUTPUT_QUEUE: usize = 64;

/// How long to wait for a bridge to acknowledge its stop signal before
/// aborting the forwarder.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Terminal bridge lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    Connecting,
    Active,
    Resizing,
    Closing,
}

/// One live bridge between an owner and their machine's shell.
pub(crate) struct TerminalBridge {
    generation: u64,
    state: Arc<StdMutex<BridgeState>>,
    master: StdMutex<Box<dyn MasterPty + Send>>,
    writer: StdMutex<Box<dyn Write + Send>>,
    killer: StdMutex<Box<dyn ChildKiller + Send + Sync>>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TerminalBridge {
    pub(crate) fn state(&self) -> BridgeState {
        *self.state.lock().expect("state lock poisoned")
    }

    /// Forward client bytes to the shell's input.
    pub(crate) fn write_input(&self, data: &[u8]) -> FleetResult<()> {
        if self.state() != BridgeState::Active {
            return Err(FleetError::Runtime(RuntimeError::Terminal(
                "bridge is not active".to_string(),
            )));
        }
        let mut writer = self.writer.lock().expect("writer lock poisoned");
        writer
            .write_all(data)
            .and_then(|_| writer.flush())
            .map_err(|e| FleetError::Runtime(RuntimeError::Io(e)))
    }

    /// Update the terminal geometry in place.
    pub(crate) fn resize(&self, rows: u16, cols: u16) -> FleetResult<()> {
        *self.state.lock().expect("state lock poisoned") = BridgeState::Resizing;
        let result = self
            .master
            .lock()
            .expect("master lock poisoned")
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| FleetError::Runtime(RuntimeError::Terminal(format!("resize: {}", e))));
        *self.state.lock().expect("state lock poisoned") = BridgeState::Active;
        result
    }

    /// Terminate the shell, close the terminal, and wait (bounded) for the
    /// forwarder to drain.
    pub(crate) async fn shutdown(self) {
        let TerminalBridge {
            state,
            killer,
            stop,
            task,
            master,
            writer,
            ..
        } = self;

        *state.lock().expect("state lock poisoned") = BridgeState::Closing;
        let _ = stop.send(true);
        if let Ok(mut killer) = killer.into_inner() {
            let _ = killer.kill();
        }

        let mut task = task;
        if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
            task.abort();
        }

        // Dropping the master closes the terminal descriptor, which also
        // unblocks the reader thread.
        drop(writer);
        drop(master);
        *state.lock().expect("state lock poisoned") = BridgeState::Idle;
    }
}

/// Open a bridge for `(machine_id, owner_id)`, superseding any existing one.
pub(crate) async fn connect(
    inner: &Arc<Inner>,
    owner_id: &str,
    machine_id: u32,
    rows: u16,
    cols: u16,
) -> FleetResult<()> {
    let key = (machine_id, owner_id.to_string());

    // Fail closed: a missing machine or foreign owner emits an error
    // signal and leaves no bridge state behind.
    let view = match inner.manager.authorize(owner_id, machine_id).await {
        Ok(view) => view,
        Err(err) => {
            inner
                .hub
                .push(
                    owner_id,
                    &terminal_topic(machine_id),
                    FleetEvent::Error {
                        machine_id,
                        message: err.to_string(),
                    },
                )
                .await;
            return Err(err);
        }
    };

    if let Some((_, old)) = inner.terminals.remove(&key) {
        old.shutdown().await;
        inner
            .hub
            .push(
                owner_id,
                &terminal_topic(machine_id),
                FleetEvent::TerminalClosed {
                    machine_id,
                    reason: "superseded".to_string(),
                },
            )
            .await;
    }

    let (bridge, ready) = spawn_bridge(inner, &view, owner_id, machine_id, rows, cols)?;
    inner.terminals.insert(key, bridge);
    let _ = ready.send(());

    inner
        .hub
        .push(
            owner_id,
            &terminal_topic(machine_id),
            FleetEvent::TerminalConnected { machine_id },
        )
        .await;
    Ok(())
}

/// Tear down the bridge for a key, if one exists.
pub(crate) async fn disconnect(inner: &Arc<Inner>, owner_id: &str, machine_id: u32) {
    let key = (machine_id, owner_id.to_string());
    if let Some((_, bridge)) = inner.terminals.remove(&key) {
        bridge.shutdown().await;
        inner
            .hub
            .push(
                owner_id,
                &terminal_topic(machine_id),
                FleetEvent::TerminalClosed {
                    machine_id,
                    reason: "disconnected".to_string(),
                },
            )
            .await;
    }
}

/// Allocate the PTY, spawn the shell, and start the reader thread and
/// forwarder task. Returns the bridge and the signal that releases the
/// forwarder once the bridge is registered in the session table.
fn spawn_bridge(
    inner: &Arc<Inner>,
    view: &MachineView,
    owner_id: &str,
    machine_id: u32,
    rows: u16,
    cols: u16,
) -> FleetResult<(TerminalBridge, oneshot::Sender<()>)> {
    let state = Arc::new(StdMutex::new(BridgeState::Connecting));

    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| RuntimeError::Terminal(format!("openpty: {}", e)))?;

    let argv = inner
        .manager
        .runtime()
        .shell_command(&view.name, &view.login_user);
    let Some((program, args)) = argv.split_first() else {
        return Err(RuntimeError::Terminal("empty shell command".to_string()).into());
    };
    let mut cmd = CommandBuilder::new(program);
    for arg in args {
        cmd.arg(arg);
    }

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| RuntimeError::Terminal(format!("spawn shell: {}", e)))?;
    drop(pair.slave);

    let killer = child.clone_killer();
    let task_killer = child.clone_killer();
    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| RuntimeError::Terminal(format!("clone reader: {}", e)))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| RuntimeError::Terminal(format!("take writer: {}", e)))?;

    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(OUTPUT_QUEUE);

    // Dedicated blocking reader feeding the output queue. Exits when the
    // shell closes its side or the queue's receiver is dropped, then reaps
    // the child.
    std::thread::Builder::new()
        .name(format!("pty-reader-{}", machine_id))
        .spawn(move || {
            let mut reader = reader;
            let mut child = child;
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if out_tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = child.wait();
        })
        .map_err(|e| RuntimeError::Terminal(format!("reader thread: {}", e)))?;

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let (ready_tx, ready_rx) = oneshot::channel::<()>();
    let generation = inner.generation.fetch_add(1, Ordering::Relaxed);

    let task = tokio::spawn({
        let inner = Arc::clone(inner);
        let owner = owner_id.to_string();
        let state = Arc::clone(&state);
        async move {
            // Hold off until the bridge is in the session table, so the
            // deregistration below can never race the insert.
            let _ = ready_rx.await;

            let reason = loop {
                tokio::select! {
                    _ = stop_rx.changed() => break "disconnected",
                    chunk = out_rx.recv() => match chunk {
                        None => break "shell exited",
                        Some(data) => {
                            let event = FleetEvent::TerminalOutput {
                                machine_id,
                                data: String::from_utf8_lossy(&data).into_owned(),
                            };
                            if inner.hub.push(&owner, &terminal_topic(machine_id), event).await == 0 {
                                break "owner transport gone";
                            }
                        }
                    }
                }
            };

            *state.lock().expect("state lock poisoned") = BridgeState::Closing;
            {
                let mut killer = task_killer;
                let _ = killer.kill();
            }

            // Deregister unless a newer bridge already took the key. The
            // closing event only fires if we were still the registered
            // bridge; explicit disconnect and supersede announce it
            // themselves.
            let removed = inner
                .terminals
                .remove_if(&(machine_id, owner.clone()), |_, b| {
                    b.generation == generation
                });
            if removed.is_some() {
                inner
                    .hub
                    .push(
                        &owner,
                        &terminal_topic(machine_id),
                        FleetEvent::TerminalClosed {
                            machine_id,
                            reason: reason.to_string(),
                        },
                    )
                    .await;
            }
            debug!(
                "terminal bridge for machine {} closed: {}",
                machine_id, reason
            );
        }
    });

    *state.lock().expect("state lock poisoned") = BridgeState::Active;
    Ok((
        TerminalBridge {
            generation,
            state,
            master: StdMutex::new(pair.master),
            writer: StdMutex::new(writer),
            killer: StdMutex::new(killer),
            stop: stop_tx,
            task,
        },
        ready_tx,
    ))
}
