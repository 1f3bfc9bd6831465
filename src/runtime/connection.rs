//! Registry of active connections.
//!
//! Maps each connection id to the token serving it. A token is present
//! exactly while it is active; removal is the single point that decides who
//! performs a release.

use crate::runtime::{ConnectionId, ConnectionToken};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// Concurrent id-to-token map.
///
/// Provides insert, lookup and remove from any worker thread without a global
/// lock.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionToken>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            connections: DashMap::with_capacity(capacity),
        }
    }

    /// Register `token` under `conn_id`.
    ///
    /// Returns `false` and leaves the existing entry alone if the id is
    /// already taken.
    pub fn insert(&self, conn_id: ConnectionId, token: Arc<ConnectionToken>) -> bool {
        match self.connections.entry(conn_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(token);
                true
            }
        }
    }

    pub fn get(&self, conn_id: ConnectionId) -> Option<Arc<ConnectionToken>> {
        self.connections.get(&conn_id).map(|e| Arc::clone(e.value()))
    }

    /// Remove a connection. Of any number of concurrent callers for the same
    /// id, exactly one receives the token.
    pub fn remove(&self, conn_id: ConnectionId) -> Option<Arc<ConnectionToken>> {
        self.connections.remove(&conn_id).map(|(_, token)| token)
    }

    pub fn contains(&self, conn_id: ConnectionId) -> bool {
        self.connections.contains_key(&conn_id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Snapshot of the registered ids.
    ///
    /// Collected up front so callers may remove entries while walking it.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|e| *e.key()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::LineCodec;
    use crate::runtime::buffer::{discard_sink, HandlePool};
    use std::time::Duration;

    fn token(pool: &HandlePool) -> Arc<ConnectionToken> {
        ConnectionToken::new(
            pool.pop(),
            pool.pop(),
            Arc::new(LineCodec::default()),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_connection_registry() {
        let pool = HandlePool::new(4, 16, discard_sink());
        let registry = ConnectionRegistry::with_capacity(2);
        let (id1, id2) = (ConnectionId::new(), ConnectionId::new());
        let t1 = token(&pool);

        assert!(registry.insert(id1, Arc::clone(&t1)));
        assert!(registry.insert(id2, token(&pool)));
        assert_eq!(registry.len(), 2);

        // Duplicate id keeps the existing entry
        assert!(!registry.insert(id1, token(&pool)));
        assert!(Arc::ptr_eq(&registry.get(id1).unwrap(), &t1));

        let mut ids = registry.ids();
        ids.sort();
        let mut expected = vec![id1, id2];
        expected.sort();
        assert_eq!(ids, expected);

        assert!(registry.remove(id1).is_some());
        assert!(registry.remove(id1).is_none());
        assert!(!registry.contains(id1));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_concurrent_remove_has_one_winner() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let pool = HandlePool::new(2, 16, discard_sink());
        let registry = ConnectionRegistry::new();
        let conn_id = ConnectionId::new();
        registry.insert(conn_id, token(&pool));

        let winners = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    if registry.remove(conn_id).is_some() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }
}
