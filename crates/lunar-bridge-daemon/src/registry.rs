//! Live duplex connections and their roles.
//!
//! At most one connection holds [`Role::Hardware`]. The registry owns each
//! connection's outbox sender, so removing an entry closes its outbound
//! channel and lets the writer task shut the socket.

use crate::classify::Claim;
use crate::config::OverflowPolicy;
use lunar_bridge_core::Role;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;

/// Serialized message queued for one connection.
pub type Outbound = Arc<str>;

/// Opaque handle for a duplex peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A registered duplex peer.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub addr: SocketAddr,
    pub role: Role,
    pub last_activity: Instant,
    outbox: mpsc::Sender<Outbound>,
}

/// Result of queueing a message on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Outbox full, message dropped, connection kept.
    Dropped,
    /// Outbox full and the policy says to disconnect.
    Overflowed,
    /// Writer is gone.
    Closed,
}

impl Connection {
    /// Queue a message without waiting.
    pub fn deliver(&self, text: Outbound, policy: OverflowPolicy) -> Delivery {
        match self.outbox.try_send(text) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
            Err(TrySendError::Full(_)) => match policy {
                OverflowPolicy::DropNewest => Delivery::Dropped,
                OverflowPolicy::Disconnect => Delivery::Overflowed,
            },
        }
    }
}

/// How applying a claim changed the registry.
#[derive(Debug)]
pub enum Assignment {
    /// Role unchanged (already classified, or nothing to apply).
    Unchanged(Role),
    BecameObserver,
    BecameHardware {
        /// Previous hardware holder, already removed from the registry.
        displaced: Option<Connection>,
    },
    /// Inferred hardware traffic while another connection holds the slot.
    SlotTaken,
}

#[derive(Debug, Default)]
pub struct Registry {
    connections: HashMap<ConnectionId, Connection>,
    hardware: Option<ConnectionId>,
    next_id: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a new unclassified connection.
    pub fn register(
        &mut self,
        addr: SocketAddr,
        outbox: mpsc::Sender<Outbound>,
        now: Instant,
    ) -> ConnectionId {
        self.next_id += 1;
        let id = ConnectionId(self.next_id);
        self.connections.insert(
            id,
            Connection {
                id,
                addr,
                role: Role::Unclassified,
                last_activity: now,
                outbox,
            },
        );
        id
    }

    /// Remove a connection. Clears the hardware slot if it held it.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let conn = self.connections.remove(&id)?;
        if self.hardware == Some(id) {
            self.hardware = None;
        }
        Some(conn)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn touch(&mut self, id: ConnectionId, now: Instant) {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.last_activity = now;
        }
    }

    /// Apply what a message said about its sender.
    pub fn apply(&mut self, id: ConnectionId, claim: Option<Claim>) -> Assignment {
        let Some(role) = self.connections.get(&id).map(|c| c.role) else {
            return Assignment::Unchanged(Role::Unclassified);
        };

        match (claim, role) {
            (Some(Claim::HardwareExplicit), Role::Hardware) => Assignment::Unchanged(Role::Hardware),
            (Some(Claim::HardwareExplicit), _) => self.promote(id),
            (Some(Claim::HardwareInferred), Role::Unclassified) => {
                if self.hardware.is_some() {
                    Assignment::SlotTaken
                } else {
                    self.promote(id)
                }
            }
            (Some(Claim::Observer), Role::Unclassified) => {
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.role = Role::Observer;
                }
                Assignment::BecameObserver
            }
            (_, role) => Assignment::Unchanged(role),
        }
    }

    fn promote(&mut self, id: ConnectionId) -> Assignment {
        let displaced = match self.hardware {
            Some(previous) if previous != id => self.remove(previous),
            _ => None,
        };
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.role = Role::Hardware;
        }
        self.hardware = Some(id);
        Assignment::BecameHardware { displaced }
    }

    pub fn hardware(&self) -> Option<&Connection> {
        self.hardware.and_then(|id| self.connections.get(&id))
    }

    pub fn hardware_id(&self) -> Option<ConnectionId> {
        self.hardware
    }

    /// Every connection that receives fan-out: all but the hardware peer.
    pub fn fan_out_targets(&self) -> impl Iterator<Item = &Connection> {
        self.connections
            .values()
            .filter(|conn| conn.role != Role::Hardware)
    }

    pub fn observer_count(&self) -> usize {
        self.connections
            .values()
            .filter(|conn| conn.role == Role::Observer)
            .count()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
