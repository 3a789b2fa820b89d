//! Connection registry: at most one live session per remote node.

use std::collections::HashMap;
use std::fmt;

use crate::identity::NodeId;

/// Opaque handle for one transport session. Never reused within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle(u64);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle: Pending -> Open -> Closed, or Pending -> Closed on handshake failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Pending,
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone)]
pub struct Connection {
    pub handle: ConnectionHandle,
    pub state: ConnectionState,
    pub direction: Direction,
}

/// Result of registering a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// New entry created.
    New(ConnectionHandle),
    /// Existing entry kept (outbound connect to a known remote).
    Reused(ConnectionHandle),
    /// Existing entry replaced; the old handle must be closed by the host.
    Replaced {
        handle: ConnectionHandle,
        old: ConnectionHandle,
    },
}

impl Registration {
    pub fn handle(&self) -> ConnectionHandle {
        match *self {
            Registration::New(h) | Registration::Reused(h) => h,
            Registration::Replaced { handle, .. } => handle,
        }
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: HashMap<NodeId, Connection>,
    next_handle: u64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&mut self) -> ConnectionHandle {
        self.next_handle += 1;
        ConnectionHandle(self.next_handle)
    }

    /// Outbound session. Reuses an existing entry for the same remote.
    pub fn register_outbound(&mut self, remote: &NodeId) -> Registration {
        if let Some(existing) = self.entries.get(remote) {
            return Registration::Reused(existing.handle);
        }
        let handle = self.allocate();
        self.entries.insert(
            remote.clone(),
            Connection {
                handle,
                state: ConnectionState::Pending,
                direction: Direction::Outbound,
            },
        );
        tracing::debug!(%remote, %handle, "registered outbound session");
        Registration::New(handle)
    }

    /// Inbound session. Replaces an existing entry for the same remote.
    pub fn register_inbound(&mut self, remote: &NodeId) -> Registration {
        let handle = self.allocate();
        let previous = self.entries.insert(
            remote.clone(),
            Connection {
                handle,
                state: ConnectionState::Pending,
                direction: Direction::Inbound,
            },
        );
        match previous {
            Some(old) => {
                tracing::debug!(
                    %remote,
                    %handle,
                    old = %old.handle,
                    "inbound session replaced existing entry"
                );
                Registration::Replaced {
                    handle,
                    old: old.handle,
                }
            }
            None => {
                tracing::debug!(%remote, %handle, "registered inbound session");
                Registration::New(handle)
            }
        }
    }

    /// Pending -> Open. Returns false for stale handles and entries that are already open.
    pub fn mark_open(&mut self, remote: &NodeId, handle: ConnectionHandle) -> bool {
        match self.entries.get_mut(remote) {
            Some(c) if c.handle == handle && c.state == ConnectionState::Pending => {
                c.state = ConnectionState::Open;
                true
            }
            _ => false,
        }
    }

    /// Close the session if `handle` is the current one. Returns the closed connection.
    pub fn close(&mut self, remote: &NodeId, handle: ConnectionHandle) -> Option<Connection> {
        if self.entries.get(remote)?.handle != handle {
            return None;
        }
        self.remove(remote)
    }

    /// Drop the entry for `remote`, whatever its handle. Idempotent.
    pub fn remove(&mut self, remote: &NodeId) -> Option<Connection> {
        self.entries.remove(remote).map(|mut c| {
            tracing::debug!(%remote, handle = %c.handle, "session closed");
            c.state = ConnectionState::Closed;
            c
        })
    }

    pub fn get(&self, remote: &NodeId) -> Option<&Connection> {
        self.entries.get(remote)
    }

    pub fn handle_of(&self, remote: &NodeId) -> Option<ConnectionHandle> {
        self.entries.get(remote).map(|c| c.handle)
    }

    pub fn is_open(&self, remote: &NodeId) -> bool {
        self.entries
            .get(remote)
            .is_some_and(|c| c.state == ConnectionState::Open)
    }

    /// Open sessions, sorted by remote ID.
    pub fn open_peers(&self) -> Vec<(NodeId, ConnectionHandle)> {
        let mut out: Vec<(NodeId, ConnectionHandle)> = self
            .entries
            .iter()
            .filter(|(_, c)| c.state == ConnectionState::Open)
            .map(|(id, c)| (id.clone(), c.handle))
            .collect();
        out.sort();
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &Connection)> {
        self.entries.iter()
    }

    /// Remove every entry, returning the handles to close.
    pub fn drain(&mut self) -> Vec<ConnectionHandle> {
        let mut handles: Vec<ConnectionHandle> =
            self.entries.drain().map(|(_, c)| c.handle).collect();
        handles.sort();
        handles
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
