use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use redis::aio::{ConnectionManager, PubSubSink};
use redis::AsyncCommands;
use tokio::sync::Mutex;

use super::kv::KeyValueStore;
use super::pubsub::{MessageHandler, PubSub, SubscriptionId};
use crate::error::GatewayError;

type HandlerTable = DashMap<String, Vec<(SubscriptionId, MessageHandler)>>;

/// Redis-backed shared store.
///
/// Commands go through a [`ConnectionManager`]; pub/sub uses one dedicated
/// connection per process whose read half is drained by a background task
/// that fans messages out to the registered handlers.
pub struct RedisStore {
    conn: ConnectionManager,
    sink: Mutex<PubSubSink>,
    handlers: Arc<HandlerTable>,
    next_id: AtomicU64,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, GatewayError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        let (sink, mut stream) = client.get_async_pubsub().await?.split();

        let handlers: Arc<HandlerTable> = Arc::new(DashMap::new());
        let table = handlers.clone();

        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(err) => {
                        tracing::warn!(%channel, ?err, "dropping undecodable pubsub message");
                        continue;
                    }
                };

                let targets: Vec<MessageHandler> = table
                    .get(&channel)
                    .map(|subs| subs.iter().map(|(_, h)| h.clone()).collect())
                    .unwrap_or_default();

                for handler in targets {
                    handler(&payload);
                }
            }
            tracing::warn!("redis pubsub stream ended");
        });

        tracing::info!("redis store connected");

        Ok(Self {
            conn,
            sink: Mutex::new(sink),
            handlers,
            next_id: AtomicU64::new(1),
        })
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, GatewayError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), GatewayError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), GatewayError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, GatewayError> {
        let mut conn = self.conn.clone();
        let secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        Ok(conn.expire(key, secs).await?)
    }

    async fn persist(&self, key: &str) -> Result<bool, GatewayError> {
        let mut conn = self.conn.clone();
        Ok(conn.persist(key).await?)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, GatewayError> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(key, field).await?)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), GatewayError> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(key, field, value).await?;
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, GatewayError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.hdel(key, field).await?;
        Ok(removed > 0)
    }

    async fn hkeys(&self, key: &str) -> Result<Vec<String>, GatewayError> {
        let mut conn = self.conn.clone();
        Ok(conn.hkeys(key).await?)
    }
}

#[async_trait]
impl PubSub for RedisStore {
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, GatewayError> {
        let mut conn = self.conn.clone();
        conn.publish(channel, payload)
            .await
            .map_err(|err| GatewayError::publish(channel, err))
    }

    async fn subscribe(
        &self,
        channel: &str,
        handler: MessageHandler,
    ) -> Result<SubscriptionId, GatewayError> {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut sink = self.sink.lock().await;

        let first = !self.handlers.contains_key(channel);
        if first {
            sink.subscribe(channel).await?;
        }
        self.handlers
            .entry(channel.to_string())
            .or_default()
            .push((id, handler));

        tracing::debug!(%channel, first, "redis subscribe");
        Ok(id)
    }

    async fn unsubscribe(&self, channel: &str, id: SubscriptionId) -> Result<(), GatewayError> {
        let mut sink = self.sink.lock().await;

        let now_empty = match self.handlers.get_mut(channel) {
            Some(mut subs) => {
                subs.retain(|(sub_id, _)| *sub_id != id);
                subs.is_empty()
            }
            None => false,
        };

        if now_empty {
            self.handlers.remove(channel);
            sink.unsubscribe(channel).await?;
            tracing::debug!(%channel, "redis unsubscribe");
        }
        Ok(())
    }
}
