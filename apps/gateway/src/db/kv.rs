use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::GatewayError;

/// Key-value half of the shared store reachable by every gateway process.
///
/// Backed by Redis in production and [`MemoryStore`](super::memory::MemoryStore)
/// in tests. `set` replaces the value and clears any pending TTL, matching
/// Redis `SET`.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, GatewayError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), GatewayError>;
    async fn del(&self, key: &str) -> Result<(), GatewayError>;

    /// Schedule deletion of `key` after `ttl`. Returns `false` if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, GatewayError>;

    /// Cancel a pending expiry. Returns whether one existed.
    async fn persist(&self, key: &str) -> Result<bool, GatewayError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, GatewayError>;
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), GatewayError>;

    /// Returns whether the field existed.
    async fn hdel(&self, key: &str, field: &str) -> Result<bool, GatewayError>;
    async fn hkeys(&self, key: &str) -> Result<Vec<String>, GatewayError>;
}

/// A logical store name plus JSON helpers on top of a [`KeyValueStore`].
///
/// Keys are `<name>.<part>.<part>…`. Undecodable payloads read back as
/// `None` rather than failing, so callers fall back to "create new".
#[derive(Clone)]
pub struct Namespace {
    name: &'static str,
    kv: Arc<dyn KeyValueStore>,
}

impl Namespace {
    pub fn new(name: &'static str, kv: Arc<dyn KeyValueStore>) -> Self {
        Self { name, kv }
    }

    pub fn key(&self, parts: &[&str]) -> String {
        let mut key = String::from(self.name);
        for part in parts {
            key.push('.');
            key.push_str(part);
        }
        key
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        parts: &[&str],
    ) -> Result<Option<T>, GatewayError> {
        let key = self.key(parts);
        let raw = self.kv.get(&key).await?;
        Ok(decode(&key, raw))
    }

    pub async fn set_json<T: Serialize>(&self, parts: &[&str], value: &T) -> Result<(), GatewayError> {
        let value = serde_json::to_string(value)?;
        self.kv.set(&self.key(parts), &value).await
    }

    pub async fn del(&self, parts: &[&str]) -> Result<(), GatewayError> {
        self.kv.del(&self.key(parts)).await
    }

    pub async fn expire(&self, parts: &[&str], ttl: Duration) -> Result<bool, GatewayError> {
        self.kv.expire(&self.key(parts), ttl).await
    }

    pub async fn persist(&self, parts: &[&str]) -> Result<bool, GatewayError> {
        self.kv.persist(&self.key(parts)).await
    }

    pub async fn hget_json<T: DeserializeOwned>(
        &self,
        parts: &[&str],
        field: &str,
    ) -> Result<Option<T>, GatewayError> {
        let key = self.key(parts);
        let raw = self.kv.hget(&key, field).await?;
        Ok(decode(&key, raw))
    }

    pub async fn hset_json<T: Serialize>(
        &self,
        parts: &[&str],
        field: &str,
        value: &T,
    ) -> Result<(), GatewayError> {
        let value = serde_json::to_string(value)?;
        self.kv.hset(&self.key(parts), field, &value).await
    }

    pub async fn hdel(&self, parts: &[&str], field: &str) -> Result<bool, GatewayError> {
        self.kv.hdel(&self.key(parts), field).await
    }

    pub async fn hkeys(&self, parts: &[&str]) -> Result<Vec<String>, GatewayError> {
        self.kv.hkeys(&self.key(parts)).await
    }
}

fn decode<T: DeserializeOwned>(key: &str, raw: Option<String>) -> Option<T> {
    let raw = raw?;
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(%key, ?err, "discarding malformed stored value");
            None
        }
    }
}
