//! Owner hub: routes events to every open connection of an owner.

use dashmap::DashMap;
use log::{debug, info};
use tokio::sync::mpsc;

use super::types::FleetEvent;

/// Size of the per-connection send buffer.
const CONNECTION_BUFFER_SIZE: usize = 64;

/// An event together with the topic it was pushed under.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub topic: String,
    pub event: FleetEvent,
}

/// A sender for events to a specific connection.
pub type OwnerSender = mpsc::Sender<Envelope>;

/// Hub managing all owner connections.
///
/// The hub is responsible for:
/// - Tracking active connections per owner
/// - Delivering pushed events to every live connection of that owner
/// - Pruning connections whose receiver has gone away
pub struct OwnerHub {
    /// Owner ID -> list of their connection senders.
    connections: DashMap<String, Vec<OwnerSender>>,
}

impl OwnerHub {
    /// Create a new hub.
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Register a new connection for an owner.
    ///
    /// Returns a receiver for events targeted at this connection and the
    /// connection id.
    pub fn register_connection(&self, owner_id: &str) -> (mpsc::Receiver<Envelope>, usize) {
        let (tx, rx) = mpsc::channel(CONNECTION_BUFFER_SIZE);
        let mut conns = self.connections.entry(owner_id.to_string()).or_default();
        let conn_id = conns.len();
        conns.push(tx);
        info!("registered connection {} for owner {}", conn_id, owner_id);
        (rx, conn_id)
    }

    /// Unregister a connection.
    pub fn unregister_connection(&self, owner_id: &str, conn_id: usize) {
        if let Some(mut conns) = self.connections.get_mut(owner_id)
            && conn_id < conns.len()
        {
            conns.remove(conn_id);
            info!("unregistered connection {} for owner {}", conn_id, owner_id);
        }
        self.connections.retain(|_, v| !v.is_empty());
    }

    /// Push an event to every live connection of an owner.
    ///
    /// Returns the number of connections the event was delivered to; zero
    /// means the owner's transport is gone and pushing loops should stop.
    pub async fn push(&self, owner_id: &str, topic: &str, event: FleetEvent) -> usize {
        let senders: Vec<OwnerSender> = match self.connections.get(owner_id) {
            Some(conns) => conns.iter().filter(|tx| !tx.is_closed()).cloned().collect(),
            None => return 0,
        };

        let mut delivered = 0;
        for tx in &senders {
            let envelope = Envelope {
                topic: topic.to_string(),
                event: event.clone(),
            };
            if tx.send(envelope).await.is_ok() {
                delivered += 1;
            } else {
                debug!("dropping dead connection for owner {}", owner_id);
            }
        }

        if delivered < senders.len()
            && let Some(mut conns) = self.connections.get_mut(owner_id)
        {
            conns.retain(|tx| !tx.is_closed());
        }

        delivered
    }

    /// Whether the owner has at least one live connection.
    pub fn is_connected(&self, owner_id: &str) -> bool {
        self.connections
            .get(owner_id)
            .map(|conns| conns.iter().any(|tx| !tx.is_closed()))
            .unwrap_or(false)
    }

    /// Count of owners with registered connections.
    pub fn connected_owner_count(&self) -> usize {
        self.connections.len()
    }
}

impl Default for OwnerHub {
    fn default() -> Self {
        Self::new()
    }
}
