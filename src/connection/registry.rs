//! Connection Registry
//!
//! Single source of truth for which sessions are connected. Backed by a
//! sharded `DashMap`, so add/remove/lookup from the acceptor and from every
//! session task never wait on socket I/O.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use super::session::SessionHandle;
use super::types::{ConnectionId, DisconnectReason, SessionInfo};
use crate::error::ServerError;

/// Concurrent collection of live sessions, keyed by connection identity
#[derive(Default)]
pub struct ConnectionRegistry {
    sessions: DashMap<ConnectionId, Arc<SessionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. Fails if its identity is already present.
    pub fn add(&self, session: Arc<SessionHandle>) -> Result<(), ServerError> {
        let id = session.id();
        match self.sessions.entry(id) {
            Entry::Occupied(_) => Err(ServerError::DuplicateIdentity(id)),
            Entry::Vacant(slot) => {
                slot.insert(session);
                debug!(connection_id = %id, "Session registered");
                Ok(())
            }
        }
    }

    /// Remove a session if present; absent identities are ignored
    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<SessionHandle>> {
        let removed = self.sessions.remove(id).map(|(_, session)| session);
        if removed.is_some() {
            debug!(connection_id = %id, "Session unregistered");
        }
        removed
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<SessionHandle>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Look a session up by its display form (`conn-<serial>`)
    pub fn find(&self, display_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions
            .iter()
            .find(|entry| entry.key().to_string() == display_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of the registered sessions, detached from the map
    pub fn list(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Display snapshots ordered by accept order
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self.list().iter().map(|s| s.info()).collect();
        infos.sort_by_key(|info| info.id.serial());
        infos
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Ask every registered session to close. Returns how many were asked.
    pub fn close_all(&self, reason: DisconnectReason) -> usize {
        // Collect first so no shard lock is held while signalling
        let sessions = self.list();
        for session in &sessions {
            session.close(reason.clone());
        }
        sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::SessionState;
    use std::net::SocketAddr;

    fn handle(serial: u64) -> Arc<SessionHandle> {
        let addr: SocketAddr = format!("127.0.0.1:{}", 40000 + serial).parse().unwrap();
        let (handle, _outbound, _close) = SessionHandle::new(ConnectionId::new(serial, addr), 4);
        handle
    }

    #[test]
    fn test_add_get_remove() {
        let registry = ConnectionRegistry::new();
        let session = handle(1);
        let id = session.id();

        registry.add(session).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&id).is_some());
        assert!(registry.find("conn-1").is_some());

        assert!(registry.remove(&id).is_some());
        assert!(registry.is_empty());
        assert!(registry.get(&id).is_none());
    }

    #[test]
    fn test_duplicate_identity_rejected() {
        let registry = ConnectionRegistry::new();
        let first = handle(3);
        let second = handle(3);

        registry.add(first).unwrap();
        let err = registry.add(second).unwrap_err();
        assert!(matches!(err, ServerError::DuplicateIdentity(id) if id.serial() == 3));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let registry = ConnectionRegistry::new();
        let id = handle(9).id();
        assert!(registry.remove(&id).is_none());
        assert!(registry.remove(&id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_list_is_a_detached_snapshot() {
        let registry = ConnectionRegistry::new();
        registry.add(handle(1)).unwrap();
        registry.add(handle(2)).unwrap();

        let snapshot = registry.list();
        for session in &snapshot {
            // Mutating the registry while holding the snapshot must not deadlock
            registry.remove(&session.id());
        }
        assert_eq!(snapshot.len(), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot_sorted_by_serial() {
        let registry = ConnectionRegistry::new();
        for serial in [5, 2, 8] {
            registry.add(handle(serial)).unwrap();
        }
        let serials: Vec<u64> = registry.snapshot().iter().map(|i| i.id.serial()).collect();
        assert_eq!(serials, vec![2, 5, 8]);
        assert!(registry
            .snapshot()
            .iter()
            .all(|i| i.state == SessionState::Connecting));
    }

    #[test]
    fn test_close_all_signals_every_session() {
        let registry = ConnectionRegistry::new();
        let a = handle(1);
        let b = handle(2);
        registry.add(Arc::clone(&a)).unwrap();
        registry.add(Arc::clone(&b)).unwrap();

        assert_eq!(registry.close_all(DisconnectReason::ServerShutdown), 2);
        assert_eq!(a.close_requested(), Some(DisconnectReason::ServerShutdown));
        assert_eq!(b.close_requested(), Some(DisconnectReason::ServerShutdown));
    }

    #[test]
    fn test_concurrent_add_remove() {
        let registry = Arc::new(ConnectionRegistry::new());
        let workers: Vec<_> = (0..8u64)
            .map(|worker| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..50u64 {
                        let session = handle(worker * 1000 + i);
                        let id = session.id();
                        registry.add(session).unwrap();
                        let _ = registry.list();
                        if i % 2 == 0 {
                            registry.remove(&id);
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(registry.len(), 8 * 25);
    }
}
