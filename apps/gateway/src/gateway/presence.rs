//! Room membership: which users are present in a room, through which sessions.
//!
//! The shared record is the hash `rooms.sessions.<roomId>` mapping each
//! user id to the JSON list of that user's session ids in the room. A user
//! is present while the list is non-empty. Each process caches the
//! distinct user ids only for rooms whose channel it holds, updated by its
//! own writes and by room events received from other processes. Other
//! rooms are read from the store every time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use super::dispatcher::RoomEventListener;
use super::events::{Envelope, OP_ADD_USER, OP_REMOVE_USER};
use crate::db::kv::Namespace;
use crate::directory::Directory;
use crate::error::GatewayError;
use crate::models::user::User;

/// Result of removing a session from a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The user had no membership record.
    NotMember,
    /// Other sessions of the same user remain in the room.
    StillPresent,
    /// That was the user's last session; the user left the room.
    LastSession,
}

/// Cached roster of one watched room.
#[derive(Debug)]
struct RosterSlot {
    /// `None` until loaded from the store.
    ids: Option<Vec<String>>,
    /// Bumped on every membership change seen for the room. A load only
    /// installs its result if no change landed while it was reading.
    version: u64,
}

pub struct PresenceDirectory {
    store: Namespace,
    directory: Arc<dyn Directory>,
    cache: DashMap<String, RosterSlot>,
    versions: AtomicU64,
    locks: DashMap<(String, String), Arc<Mutex<()>>>,
}

impl PresenceDirectory {
    pub fn new(store: Namespace, directory: Arc<dyn Directory>) -> Self {
        Self {
            store,
            directory,
            cache: DashMap::new(),
            versions: AtomicU64::new(0),
            locks: DashMap::new(),
        }
    }

    /// Distinct user ids present in the room.
    pub async fn get_user_ids(&self, room_id: &str) -> Result<Vec<String>, GatewayError> {
        let version = match self.cache.get(room_id) {
            Some(slot) => match &slot.ids {
                Some(ids) => return Ok(ids.clone()),
                None => Some(slot.version),
            },
            None => None,
        };

        let ids = self.store.hkeys(&["sessions", room_id]).await?;
        if let Some(version) = version {
            if let Some(mut slot) = self.cache.get_mut(room_id) {
                if slot.ids.is_none() && slot.version == version {
                    slot.ids = Some(ids.clone());
                }
            }
        }
        Ok(ids)
    }

    /// Profiles of the room's users, minus `excluding`.
    pub async fn get_users(
        &self,
        room_id: &str,
        excluding: &[&str],
    ) -> Result<Vec<User>, GatewayError> {
        let ids: Vec<String> = self
            .get_user_ids(room_id)
            .await?
            .into_iter()
            .filter(|id| !excluding.contains(&id.as_str()))
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.directory.find_users(&ids).await
    }

    /// Session ids the user has in the room.
    pub async fn sessions_for(
        &self,
        room_id: &str,
        user_id: &str,
    ) -> Result<Vec<String>, GatewayError> {
        Ok(self
            .store
            .hget_json(&["sessions", room_id], user_id)
            .await?
            .unwrap_or_default())
    }

    /// Record `session_id` as present. Returns `false` if it already was.
    pub async fn add_session(
        &self,
        room_id: &str,
        user_id: &str,
        session_id: &str,
    ) -> Result<bool, GatewayError> {
        let lock = self.lock_for(room_id, user_id);
        let added = {
            let _guard = lock.lock().await;
            let mut sessions = self.sessions_for(room_id, user_id).await?;
            if sessions.iter().any(|s| s == session_id) {
                false
            } else {
                sessions.push(session_id.to_string());
                self.store
                    .hset_json(&["sessions", room_id], user_id, &sessions)
                    .await?;
                true
            }
        };
        self.release_lock(room_id, user_id, lock);

        self.cache_add(room_id, user_id);
        Ok(added)
    }

    pub async fn remove_session(
        &self,
        room_id: &str,
        user_id: &str,
        session_id: &str,
    ) -> Result<Removal, GatewayError> {
        let lock = self.lock_for(room_id, user_id);
        let removal = {
            let _guard = lock.lock().await;
            self.remove_locked(room_id, user_id, session_id).await
        };
        self.release_lock(room_id, user_id, lock);

        let removal = removal?;
        if removal == Removal::LastSession {
            self.cache_remove(room_id, user_id);
        }
        Ok(removal)
    }

    async fn remove_locked(
        &self,
        room_id: &str,
        user_id: &str,
        session_id: &str,
    ) -> Result<Removal, GatewayError> {
        let Some(mut sessions) = self
            .store
            .hget_json::<Vec<String>>(&["sessions", room_id], user_id)
            .await?
        else {
            return Ok(Removal::NotMember);
        };

        let before = sessions.len();
        sessions.retain(|s| s != session_id);

        if sessions.is_empty() {
            self.store.hdel(&["sessions", room_id], user_id).await?;
            return Ok(Removal::LastSession);
        }
        if sessions.len() != before {
            self.store
                .hset_json(&["sessions", room_id], user_id, &sessions)
                .await?;
        }
        Ok(Removal::StillPresent)
    }

    fn lock_for(&self, room_id: &str, user_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry((room_id.to_string(), user_id.to_string()))
            .or_default()
            .clone()
    }

    /// Drop the per-key lock once nobody else holds or waits on it.
    fn release_lock(&self, room_id: &str, user_id: &str, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.locks
            .remove_if(&(room_id.to_string(), user_id.to_string()), |_, m| {
                Arc::strong_count(m) == 1
            });
    }

    fn cache_add(&self, room_id: &str, user_id: &str) {
        self.touch(room_id, |ids| {
            if !ids.iter().any(|id| id == user_id) {
                ids.push(user_id.to_string());
            }
        });
    }

    fn cache_remove(&self, room_id: &str, user_id: &str) {
        self.touch(room_id, |ids| ids.retain(|id| id != user_id));
    }

    /// Apply a membership change to a watched room's slot, loaded or not.
    fn touch(&self, room_id: &str, f: impl FnOnce(&mut Vec<String>)) {
        if let Some(mut slot) = self.cache.get_mut(room_id) {
            slot.version = self.versions.fetch_add(1, Ordering::Relaxed) + 1;
            if let Some(ids) = slot.ids.as_mut() {
                f(ids);
            }
        }
    }
}

impl RoomEventListener for PresenceDirectory {
    fn room_event(&self, room_id: &str, envelope: &Envelope) {
        match envelope.op {
            OP_ADD_USER => {
                if let Some(user_id) = envelope.d["user"]["id"].as_str() {
                    self.cache_add(room_id, user_id);
                }
            }
            OP_REMOVE_USER => {
                if let Some(user_id) = envelope.d.as_str() {
                    self.cache_remove(room_id, user_id);
                }
            }
            _ => {}
        }
    }

    fn room_watched(&self, room_id: &str) {
        self.cache.entry(room_id.to_string()).or_insert_with(|| RosterSlot {
            ids: None,
            version: self.versions.fetch_add(1, Ordering::Relaxed) + 1,
        });
    }

    fn room_released(&self, room_id: &str) {
        self.cache.remove(room_id);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use std::time::Duration;

    use super::*;
    use crate::db::kv::KeyValueStore;
    use crate::db::memory::MemoryStore;
    use crate::directory::MemoryDirectory;

    fn user(id: &str) -> User {
        User {
            id: id.into(),
            username: id.into(),
            display_name: id.to_uppercase(),
            avatar_url: None,
        }
    }

    fn presence() -> (PresenceDirectory, Arc<MemoryStore>, Arc<MemoryDirectory>) {
        let store = Arc::new(MemoryStore::new());
        let directory = Arc::new(MemoryDirectory::new());
        for id in ["u1", "u2", "u3"] {
            directory.insert_user(user(id));
        }
        let presence = PresenceDirectory::new(Namespace::new("rooms", store.clone()), directory.clone());
        (presence, store, directory)
    }

    #[tokio::test]
    async fn add_session_is_idempotent() {
        let (presence, _, _) = presence();
        assert!(presence.add_session("r1", "u1", "s1").await.unwrap());
        assert!(!presence.add_session("r1", "u1", "s1").await.unwrap());
        assert!(presence.add_session("r1", "u1", "s2").await.unwrap());
        assert_eq!(presence.sessions_for("r1", "u1").await.unwrap(), vec!["s1", "s2"]);
    }

    #[tokio::test]
    async fn roster_tracks_distinct_users() {
        let (presence, _, _) = presence();
        presence.add_session("r1", "u1", "s1").await.unwrap();
        presence.add_session("r1", "u1", "s2").await.unwrap();
        presence.add_session("r1", "u2", "s3").await.unwrap();

        let mut ids = presence.get_user_ids("r1").await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["u1", "u2"]);

        assert_eq!(presence.remove_session("r1", "u1", "s1").await.unwrap(), Removal::StillPresent);
        assert_eq!(presence.remove_session("r1", "u1", "s2").await.unwrap(), Removal::LastSession);
        assert_eq!(presence.remove_session("r1", "u1", "s2").await.unwrap(), Removal::NotMember);
        assert_eq!(presence.get_user_ids("r1").await.unwrap(), vec!["u2"]);
    }

    #[tokio::test]
    async fn cached_roster_follows_local_writes() {
        let (presence, store, _) = presence();
        presence.room_watched("r1");
        presence.add_session("r1", "u1", "s1").await.unwrap();
        assert_eq!(presence.get_user_ids("r1").await.unwrap(), vec!["u1"]);

        presence.add_session("r1", "u2", "s2").await.unwrap();
        let mut ids = presence.get_user_ids("r1").await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["u1", "u2"]);

        presence.remove_session("r1", "u1", "s1").await.unwrap();
        assert_eq!(presence.get_user_ids("r1").await.unwrap(), vec!["u2"]);
        assert_eq!(store.hkeys("rooms.sessions.r1").await.unwrap(), vec!["u2"]);
    }

    #[tokio::test]
    async fn get_users_filters_before_fetch() {
        let (presence, _, directory) = presence();
        presence.add_session("r1", "u1", "s1").await.unwrap();
        presence.add_session("r1", "u2", "s2").await.unwrap();

        let users = presence.get_users("r1", &["u1"]).await.unwrap();
        assert_eq!(users, vec![user("u2")]);
        assert_eq!(directory.batch_lookups(), vec![vec!["u2".to_string()]]);

        assert!(presence.get_users("r1", &["u1", "u2"]).await.unwrap().is_empty());
        assert_eq!(directory.batch_lookups().len(), 1);
    }

    #[tokio::test]
    async fn remote_events_update_cache_and_release_evicts() {
        let (presence, store, _) = presence();
        presence.room_watched("r1");
        presence.add_session("r1", "u1", "s1").await.unwrap();
        presence.get_user_ids("r1").await.unwrap();

        presence.room_event("r1", &Envelope::new(OP_ADD_USER, json!({ "user": { "id": "u3" } }), None));
        let mut ids = presence.get_user_ids("r1").await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["u1", "u3"]);

        presence.room_event("r1", &Envelope::new(OP_REMOVE_USER, json!("u1"), None));
        assert_eq!(presence.get_user_ids("r1").await.unwrap(), vec!["u3"]);

        // Release drops the cache; the next read goes back to the store.
        presence.room_released("r1");
        assert_eq!(presence.get_user_ids("r1").await.unwrap(), vec!["u1"]);
        assert_eq!(store.hkeys("rooms.sessions.r1").await.unwrap(), vec!["u1"]);
    }

    #[tokio::test]
    async fn unwatched_rooms_read_through() {
        let (presence, store, _) = presence();
        presence.add_session("r1", "u1", "s1").await.unwrap();
        assert_eq!(presence.get_user_ids("r1").await.unwrap(), vec!["u1"]);

        // Written by another process; no event reaches this one.
        store.hset("rooms.sessions.r1", "u2", r#"["s2"]"#).await.unwrap();
        presence.room_event("r1", &Envelope::new(OP_REMOVE_USER, json!("u1"), None));

        let mut ids = presence.get_user_ids("r1").await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["u1", "u2"]);
    }

    /// Store whose `hkeys` takes a while, so writes can land mid-read.
    struct SlowHkeys(Arc<MemoryStore>);

    #[async_trait::async_trait]
    impl KeyValueStore for SlowHkeys {
        async fn get(&self, key: &str) -> Result<Option<String>, GatewayError> {
            self.0.get(key).await
        }
        async fn set(&self, key: &str, value: &str) -> Result<(), GatewayError> {
            self.0.set(key, value).await
        }
        async fn del(&self, key: &str) -> Result<(), GatewayError> {
            self.0.del(key).await
        }
        async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, GatewayError> {
            self.0.expire(key, ttl).await
        }
        async fn persist(&self, key: &str) -> Result<bool, GatewayError> {
            self.0.persist(key).await
        }
        async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, GatewayError> {
            self.0.hget(key, field).await
        }
        async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), GatewayError> {
            self.0.hset(key, field, value).await
        }
        async fn hdel(&self, key: &str, field: &str) -> Result<bool, GatewayError> {
            self.0.hdel(key, field).await
        }
        async fn hkeys(&self, key: &str) -> Result<Vec<String>, GatewayError> {
            let keys = self.0.hkeys(key).await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            keys
        }
    }

    #[tokio::test]
    async fn roster_load_discards_result_when_membership_changes() {
        let store = Arc::new(MemoryStore::new());
        let directory = Arc::new(MemoryDirectory::new());
        let presence = PresenceDirectory::new(
            Namespace::new("rooms", Arc::new(SlowHkeys(store.clone()))),
            directory,
        );
        presence.room_watched("r1");
        presence.add_session("r1", "u1", "s1").await.unwrap();

        let (loaded, added) = tokio::join!(presence.get_user_ids("r1"), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            presence.add_session("r1", "u2", "s2").await
        });
        assert_eq!(loaded.unwrap(), vec!["u1"]);
        assert!(added.unwrap());

        let mut ids = presence.get_user_ids("r1").await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["u1", "u2"]);

        // Loaded now; later reads come from the cache.
        store.hdel("rooms.sessions.r1", "u2").await.unwrap();
        let mut ids = presence.get_user_ids("r1").await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["u1", "u2"]);
    }

    #[tokio::test]
    async fn remote_event_during_load_forces_a_reload() {
        let store = Arc::new(MemoryStore::new());
        let presence = PresenceDirectory::new(
            Namespace::new("rooms", Arc::new(SlowHkeys(store.clone()))),
            Arc::new(MemoryDirectory::new()),
        );
        presence.room_watched("r1");
        store.hset("rooms.sessions.r1", "u1", r#"["s1"]"#).await.unwrap();

        let (loaded, ()) = tokio::join!(presence.get_user_ids("r1"), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            store.hset("rooms.sessions.r1", "u3", r#"["s3"]"#).await.unwrap();
            presence.room_event("r1", &Envelope::new(OP_ADD_USER, json!({ "user": { "id": "u3" } }), None));
        });
        assert_eq!(loaded.unwrap(), vec!["u1"]);

        let mut ids = presence.get_user_ids("r1").await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["u1", "u3"]);
    }

    #[tokio::test]
    async fn malformed_membership_counts_as_absent() {
        let (presence, store, _) = presence();
        store.hset("rooms.sessions.r1", "u1", "oops").await.unwrap();
        assert!(presence.sessions_for("r1", "u1").await.unwrap().is_empty());
        assert_eq!(presence.remove_session("r1", "u1", "s1").await.unwrap(), Removal::NotMember);
    }
}
