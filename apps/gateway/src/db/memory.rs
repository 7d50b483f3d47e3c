use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::kv::KeyValueStore;
use super::pubsub::{MessageHandler, PubSub, SubscriptionId};
use crate::error::GatewayError;

// ---------------------------------------------------------------------------
// In-memory shared store (single-node development / tests)
// ---------------------------------------------------------------------------

enum Value {
    Str(String),
    Hash(HashMap<String, String>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Process-local stand-in for Redis: strings, hashes, TTLs and pub/sub.
///
/// Expired keys are purged lazily on access. Published messages are
/// delivered synchronously to every handler before `publish` returns.
pub struct MemoryStore {
    data: Mutex<HashMap<String, Entry>>,
    channels: Mutex<HashMap<String, Vec<(SubscriptionId, MessageHandler)>>>,
    next_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of handlers currently subscribed to `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.lock().get(channel).map_or(0, Vec::len)
    }

    /// Remaining TTL of `key`, if one is pending.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let data = self.data.lock();
        let entry = data.get(key).filter(|e| e.is_live(now))?;
        entry.expires_at.map(|at| at.saturating_duration_since(now))
    }

    fn with_live<R>(&self, key: &str, f: impl FnOnce(Option<&mut Entry>) -> R) -> R {
        let now = Instant::now();
        let mut data = self.data.lock();
        if data.get(key).is_some_and(|e| !e.is_live(now)) {
            data.remove(key);
        }
        f(data.get_mut(key))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn wrong_type(key: &str) -> GatewayError {
    GatewayError::store(format!("WRONGTYPE operation against key {key}"))
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, GatewayError> {
        self.with_live(key, |entry| match entry {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), GatewayError> {
        self.data.lock().insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), GatewayError> {
        self.data.lock().remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, GatewayError> {
        Ok(self.with_live(key, |entry| match entry {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                true
            }
            None => false,
        }))
    }

    async fn persist(&self, key: &str) -> Result<bool, GatewayError> {
        Ok(self.with_live(key, |entry| match entry {
            Some(entry) => entry.expires_at.take().is_some(),
            None => false,
        }))
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, GatewayError> {
        self.with_live(key, |entry| match entry {
            None => Ok(None),
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => Ok(h.get(field).cloned()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), GatewayError> {
        let now = Instant::now();
        let mut data = self.data.lock();
        if data.get(key).is_some_and(|e| !e.is_live(now)) {
            data.remove(key);
        }
        let entry = data.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Hash(h) => {
                h.insert(field.to_string(), value.to_string());
                Ok(())
            }
            Value::Str(_) => Err(wrong_type(key)),
        }
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, GatewayError> {
        let now = Instant::now();
        let mut data = self.data.lock();
        let Some(entry) = data.get_mut(key).filter(|e| e.is_live(now)) else {
            return Ok(false);
        };
        let Value::Hash(h) = &mut entry.value else {
            return Err(wrong_type(key));
        };
        let existed = h.remove(field).is_some();
        // Redis drops a hash once its last field is gone.
        if h.is_empty() {
            data.remove(key);
        }
        Ok(existed)
    }

    async fn hkeys(&self, key: &str) -> Result<Vec<String>, GatewayError> {
        self.with_live(key, |entry| match entry {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => Ok(h.keys().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        })
    }
}

#[async_trait]
impl PubSub for MemoryStore {
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, GatewayError> {
        // Clone the handler list so none run under the lock.
        let handlers: Vec<MessageHandler> = self
            .channels
            .lock()
            .get(channel)
            .map(|subs| subs.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();

        for handler in &handlers {
            handler(payload);
        }
        Ok(handlers.len())
    }

    async fn subscribe(
        &self,
        channel: &str,
        handler: MessageHandler,
    ) -> Result<SubscriptionId, GatewayError> {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push((id, handler));
        Ok(id)
    }

    async fn unsubscribe(&self, channel: &str, id: SubscriptionId) -> Result<(), GatewayError> {
        let mut channels = self.channels.lock();
        if let Some(subs) = channels.get_mut(channel) {
            subs.retain(|(sub_id, _)| *sub_id != id);
            if subs.is_empty() {
                channels.remove(channel);
            }
        }
        Ok(())
    }
}
