//! Process-local registry of live connections.

use std::sync::Arc;

use dashmap::DashMap;

use super::connection::Connection;

/// Live connections on this process, keyed by connection id.
///
/// Lookups by session, room, or user read the connection's current session,
/// so they always reflect the latest bind.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, conn: Arc<Connection>) {
        self.connections.insert(conn.id.clone(), conn);
    }

    /// Removing an unknown connection is a no-op.
    pub fn remove(&self, conn: &Connection) {
        self.connections.remove(&conn.id);
    }

    /// The connection currently speaking for `session_id`, if any.
    pub fn get(&self, session_id: &str) -> Option<Arc<Connection>> {
        self.connections
            .iter()
            .find(|entry| !entry.is_superseded() && entry.session_id() == session_id)
            .map(|entry| entry.value().clone())
    }

    /// Every live connection bound to `session_id`.
    pub fn all_for_session(&self, session_id: &str) -> Vec<Arc<Connection>> {
        self.filter(|conn| conn.session_id() == session_id)
    }

    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.filter(|_| true)
    }

    pub fn all_in_room(&self, room_id: &str) -> Vec<Arc<Connection>> {
        self.filter(|conn| conn.room_id().as_deref() == Some(room_id))
    }

    pub fn all_for_user(&self, user_id: &str) -> Vec<Arc<Connection>> {
        self.filter(|conn| conn.user_id().as_deref() == Some(user_id))
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Superseded connections are never recipients.
    fn filter(&self, pred: impl Fn(&Connection) -> bool) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .filter(|entry| !entry.is_superseded() && pred(entry.value()))
            .map(|entry| entry.value().clone())
            .collect()
    }
}
