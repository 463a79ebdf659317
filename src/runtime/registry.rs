//! Registry of live connections.
//!
//! Connections live in a slab and are addressed by a stable integer id.
//! A second map goes from raw descriptor to id. Removing a connection
//! drops both entries together, so a descriptor number the OS hands out
//! again later can never resolve to a stale connection.

use crate::runtime::Connection;
use slab::Slab;
use std::collections::HashMap;
use std::os::unix::io::RawFd;

/// Stable connection identifier (slab key).
pub type ConnId = usize;

/// Owning registry of connections with an optional size limit.
pub struct ConnectionRegistry<S> {
    connections: Slab<Connection<S>>,
    by_fd: HashMap<RawFd, ConnId>,
    max_connections: Option<usize>,
}

impl<S> ConnectionRegistry<S> {
    /// Create a registry. `None` means unbounded.
    pub fn new(max_connections: Option<usize>) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.unwrap_or(0).min(4096)),
            by_fd: HashMap::new(),
            max_connections,
        }
    }

    /// Whether another connection would exceed the limit.
    pub fn is_full(&self) -> bool {
        self.max_connections
            .is_some_and(|max| self.connections.len() >= max)
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns the connection back if the registry is at capacity.
    pub fn insert(&mut self, conn: Connection<S>) -> Result<ConnId, Connection<S>> {
        if self.is_full() {
            return Err(conn);
        }
        let fd = conn.fd();
        let id = self.connections.insert(conn);
        self.by_fd.insert(fd, id);
        Ok(id)
    }

    /// Get a mutable reference to a connection.
    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection<S>> {
        self.connections.get_mut(id)
    }

    /// Look a connection up by descriptor.
    pub fn id_of(&self, fd: RawFd) -> Option<ConnId> {
        self.by_fd.get(&fd).copied()
    }

    /// Remove a connection, handing ownership back to the caller.
    pub fn remove(&mut self, id: ConnId) -> Option<Connection<S>> {
        let conn = self.connections.try_remove(id)?;
        self.by_fd.remove(&conn.fd());
        Some(conn)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Ids of all connections, for sweeps that may remove entries.
    pub fn ids(&self) -> Vec<ConnId> {
        self.connections.iter().map(|(id, _)| id).collect()
    }

    /// Remove every connection.
    pub fn drain(&mut self) -> impl Iterator<Item = Connection<S>> + '_ {
        self.by_fd.clear();
        self.connections.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::connection::tests::ScriptedStream;

    fn conn(fd: RawFd) -> Connection<ScriptedStream> {
        Connection::new(fd, ScriptedStream::default())
    }

    #[test]
    fn test_connection_registry() {
        let mut registry = ConnectionRegistry::new(Some(2));

        let id1 = registry.insert(conn(10)).unwrap();
        let id2 = registry.insert(conn(11)).unwrap();

        // At capacity
        assert!(registry.is_full());
        let rejected = registry.insert(conn(12)).unwrap_err();
        assert_eq!(rejected.fd(), 12);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get_mut(id1).unwrap().fd(), 10);
        assert_eq!(registry.id_of(11), Some(id2));

        let removed = registry.remove(id1).unwrap();
        assert_eq!(removed.fd(), 10);
        assert!(registry.get_mut(id1).is_none());
        assert_eq!(registry.id_of(10), None);
        assert!(registry.remove(id1).is_none());
        assert_eq!(registry.len(), 1);
        assert!(!registry.is_full());
    }

    #[test]
    fn test_descriptor_reuse() {
        let mut registry = ConnectionRegistry::new(None);
        let first = registry.insert(conn(20)).unwrap();
        registry.remove(first);

        // The OS may hand the same descriptor number to a new peer.
        let second = registry.insert(conn(20)).unwrap();
        assert_eq!(registry.id_of(20), Some(second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unbounded_and_drain() {
        let mut registry = ConnectionRegistry::new(None);
        for fd in 0..100 {
            registry.insert(conn(fd)).unwrap();
        }
        assert!(!registry.is_full());
        assert_eq!(registry.ids().len(), 100);

        let drained: Vec<_> = registry.drain().collect();
        assert_eq!(drained.len(), 100);
        assert_eq!(registry.len(), 0);
        assert_eq!(registry.id_of(5), None);
    }
}
