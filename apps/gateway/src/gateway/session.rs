//! Durable session records shared by every gateway process.

use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::db::kv::Namespace;
use crate::error::GatewayError;

/// A client session. Outlives any single connection by the expiry window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub room_id: Option<String>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: roomcast_common::id::prefixed_ulid(roomcast_common::id::prefix::SESSION),
            user_id: None,
            room_id: None,
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Write-through cache over the `sessions` store.
pub struct SessionDirectory {
    store: Namespace,
    cache: DashMap<String, Session>,
    expiry: Duration,
}

impl SessionDirectory {
    pub fn new(store: Namespace, expiry: Duration) -> Self {
        Self {
            store,
            cache: DashMap::new(),
            expiry,
        }
    }

    /// Default expiry applied on disconnect.
    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    pub async fn get(&self, id: &str) -> Result<Option<Session>, GatewayError> {
        if let Some(session) = self.cache.get(id) {
            return Ok(Some(session.clone()));
        }
        let stored: Option<Session> = self.store.get_json(&[id]).await?;
        if let Some(session) = &stored {
            self.cache.insert(id.to_string(), session.clone());
        }
        Ok(stored)
    }

    pub async fn save(&self, session: &Session) -> Result<(), GatewayError> {
        self.store.set_json(&[session.id.as_str()], session).await?;
        self.cache.insert(session.id.clone(), session.clone());
        Ok(())
    }

    /// Schedule the stored session for deletion and drop the cached copy.
    pub async fn expire(&self, id: &str, ttl: Duration) -> Result<bool, GatewayError> {
        self.cache.remove(id);
        self.store.expire(&[id], ttl).await
    }

    /// Cancel a pending expiry. Calling it twice is harmless.
    pub async fn persist(&self, id: &str) -> Result<bool, GatewayError> {
        self.store.persist(&[id]).await
    }
}
