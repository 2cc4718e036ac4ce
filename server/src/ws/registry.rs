use dashmap::DashMap;
use std::collections::HashMap;

use super::ConnectionId;

/// Session registry: which live connection currently speaks for each user.
///
/// One session per user. A newer registration silently replaces the older
/// mapping (last writer wins).
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    sessions: DashMap<String, ConnectionId>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite. Returns the connection that was replaced, if any.
    pub fn register(&self, user_id: &str, connection_id: &str) -> Option<ConnectionId> {
        self.sessions
            .insert(user_id.to_string(), connection_id.to_string())
    }

    pub fn unregister(&self, user_id: &str) -> Option<ConnectionId> {
        self.sessions.remove(user_id).map(|(_, conn)| conn)
    }

    /// Remove the mapping only while it still points at `connection_id`.
    /// A connection that was superseded by a newer login cannot evict it.
    pub fn unregister_connection(&self, user_id: &str, connection_id: &str) -> bool {
        self.sessions
            .remove_if(user_id, |_, current| current == connection_id)
            .is_some()
    }

    pub fn lookup(&self, user_id: &str) -> Option<ConnectionId> {
        self.sessions.get(user_id).map(|conn| conn.value().clone())
    }

    pub fn snapshot_all(&self) -> HashMap<String, ConnectionId> {
        self.sessions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
