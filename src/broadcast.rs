//! Connection registry with ordered fan-out.
//!
//! The registry owns the set of live connections. Registration queues the
//! full replay of the log onto the new connection before returning, and
//! `broadcast` pushes each new entry to every live connection; because both
//! run under the server's single core lock, a connection sees exactly the
//! log from index 0 onward — no gaps, no duplicates.
//!
//! Iteration over the live set is never exposed; callers go through
//! `register` / `broadcast` / `deregister` only.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::LogEntry;

/// Identity of one live connection.
pub type ConnectionId = Uuid;

/// Per-connection resources held by the registry: the outbound frame queue
/// and the heartbeat timer keeping the transport's liveness detection fed.
pub struct ConnectionHandle {
    sender: mpsc::UnboundedSender<Message>,
    heartbeat: Option<JoinHandle<()>>,
}

impl ConnectionHandle {
    /// A handle with no heartbeat task (tests, short-lived connections).
    pub fn new(sender: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            sender,
            heartbeat: None,
        }
    }

    /// A handle whose heartbeat task is cancelled on deregistration.
    pub fn with_heartbeat(
        sender: mpsc::UnboundedSender<Message>,
        heartbeat: JoinHandle<()>,
    ) -> Self {
        Self {
            sender,
            heartbeat: Some(heartbeat),
        }
    }
}

/// The set of currently-live connections.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, ConnectionHandle>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
        }
    }

    /// Add a connection and queue the full replay onto it, in index order.
    ///
    /// If the connection's outbound queue is already closed the connection
    /// is dropped immediately and `false` is returned.
    pub fn register(
        &mut self,
        id: ConnectionId,
        handle: ConnectionHandle,
        replay: Vec<LogEntry>,
    ) -> bool {
        self.connections.insert(id, handle);

        for entry in replay {
            if !self.send_to(id, &entry) {
                self.deregister(id);
                return false;
            }
        }
        true
    }

    /// Push one entry to every live connection.
    ///
    /// A failed connection is deregistered without affecting delivery to the
    /// others. Returns the number of connections the entry was queued for.
    pub fn broadcast(&mut self, entry: &LogEntry) -> usize {
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        let mut delivered = 0;

        for id in ids {
            if self.send_to(id, entry) {
                delivered += 1;
            } else {
                log::debug!("evicting dead connection {id}");
                self.deregister(id);
            }
        }
        delivered
    }

    /// Remove a connection, cancelling its heartbeat task.
    ///
    /// Idempotent: removing an unknown or already-removed connection returns
    /// `false` and has no other effect.
    pub fn deregister(&mut self, id: ConnectionId) -> bool {
        match self.connections.remove(&id) {
            Some(handle) => {
                if let Some(heartbeat) = handle.heartbeat {
                    heartbeat.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// True if no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// True if the connection is currently registered.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    fn send_to(&self, id: ConnectionId, entry: &LogEntry) -> bool {
        let Some(handle) = self.connections.get(&id) else {
            return false;
        };
        let frame = match entry.encode() {
            Ok(text) => Message::text(text),
            Err(e) => {
                log::error!("failed to encode entry {}: {e}", entry.index);
                return false;
            }
        };
        handle.sender.send(frame).is_ok()
    }
}
