//! Routes envelopes to local connections and to the other gateway processes.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Mutex;

use super::broker::{Broker, BrokerMessage};
use super::events::Envelope;
use super::registry::ConnectionRegistry;
use super::target::{MessageTarget, Route};
use crate::db::pubsub::SubscriptionId;
use crate::error::GatewayError;

/// Told about room traffic arriving from other processes.
pub trait RoomEventListener: Send + Sync {
    fn room_event(&self, room_id: &str, envelope: &Envelope);

    /// This process now holds the room's channel and will see its events.
    fn room_watched(&self, room_id: &str);

    /// This process no longer holds the room's channel.
    fn room_released(&self, room_id: &str);
}

struct ChannelSubscription {
    count: usize,
    handle: SubscriptionId,
}

/// State reachable from the broker receive handler.
struct Shared {
    node_id: String,
    connections: Arc<ConnectionRegistry>,
    listeners: RwLock<Vec<Arc<dyn RoomEventListener>>>,
}

impl Shared {
    fn deliver(&self, envelope: &Envelope, target: &MessageTarget) -> usize {
        let recipients = match &target.route {
            Route::Room(id) => self.connections.all_in_room(id),
            Route::User(id) => self.connections.all_for_user(id),
            Route::Broadcast => self.connections.all(),
        };

        let mut delivered = 0;
        for conn in recipients {
            if target.is_ignored(&conn.session_id()) {
                continue;
            }
            match conn.send(envelope.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => tracing::warn!(conn_id = %conn.id, op = envelope.op, "dropping send to closed connection"),
            }
        }
        delivered
    }

    fn receive(&self, message: BrokerMessage) {
        if message.origin == self.node_id {
            return;
        }
        self.deliver(&message.message, &message.target);

        if let Route::Room(room_id) = &message.target.route {
            for listener in self.listeners.read().iter() {
                listener.room_event(room_id, &message.message);
            }
        }
    }
}

pub struct Dispatcher {
    shared: Arc<Shared>,
    broker: Broker,
    subscriptions: Mutex<HashMap<String, ChannelSubscription>>,
}

impl Dispatcher {
    pub fn new(node_id: String, connections: Arc<ConnectionRegistry>, broker: Broker) -> Self {
        Self {
            shared: Arc::new(Shared {
                node_id,
                connections,
                listeners: RwLock::new(Vec::new()),
            }),
            broker,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.shared.node_id
    }

    pub fn add_listener(&self, listener: Arc<dyn RoomEventListener>) {
        self.shared.listeners.write().push(listener);
    }

    /// Deliver locally, then publish to the target's channel.
    ///
    /// A publish failure is returned after local delivery has happened;
    /// local delivery is never repeated. Returns the number of processes
    /// reached remotely.
    pub async fn dispatch<T: Serialize>(
        &self,
        op: u8,
        data: &T,
        target: &MessageTarget,
        time: Option<i64>,
    ) -> Result<usize, GatewayError> {
        let envelope = Envelope::with_data(op, data, time)?;
        let local = self.shared.deliver(&envelope, target);
        tracing::debug!(op, route = ?target.route, local, "dispatch");
        self.remote_dispatch(&envelope, target).await
    }

    /// Returns how many local connections received the envelope.
    pub fn local_dispatch<T: Serialize>(
        &self,
        op: u8,
        data: &T,
        target: &MessageTarget,
        time: Option<i64>,
    ) -> Result<usize, GatewayError> {
        let envelope = Envelope::with_data(op, data, time)?;
        Ok(self.shared.deliver(&envelope, target))
    }

    /// `Broadcast` has no channel and publishes nothing.
    pub async fn remote_dispatch(
        &self,
        envelope: &Envelope,
        target: &MessageTarget,
    ) -> Result<usize, GatewayError> {
        let Some(channel) = target.channel() else {
            return Ok(0);
        };
        let message = BrokerMessage {
            origin: self.shared.node_id.clone(),
            target: target.clone(),
            message: envelope.clone(),
        };
        self.broker.publish(&channel, &message).await
    }

    /// Take a reference on the target's channel, subscribing on the first one.
    pub async fn register(&self, target: &MessageTarget) -> Result<(), GatewayError> {
        let Some(channel) = target.channel() else {
            return Ok(());
        };
        let mut subs = self.subscriptions.lock().await;

        if let Some(sub) = subs.get_mut(&channel) {
            sub.count += 1;
            return Ok(());
        }

        let shared = self.shared.clone();
        let handle = self
            .broker
            .subscribe(&channel, Arc::new(move |message| shared.receive(message)))
            .await?;
        subs.insert(channel.clone(), ChannelSubscription { count: 1, handle });

        if let Route::Room(room_id) = &target.route {
            for listener in self.shared.listeners.read().iter() {
                listener.room_watched(room_id);
            }
        }
        tracing::debug!(%channel, "channel subscribed");
        Ok(())
    }

    /// Drop a reference, unsubscribing on the last one. Unknown or unreferenced
    /// channels are ignored.
    pub async fn unregister(&self, target: &MessageTarget) -> Result<(), GatewayError> {
        let Some(channel) = target.channel() else {
            return Ok(());
        };
        let mut subs = self.subscriptions.lock().await;

        let Some(sub) = subs.get_mut(&channel) else {
            return Ok(());
        };
        match sub.count {
            0 => return Ok(()),
            1 => {}
            _ => {
                sub.count -= 1;
                return Ok(());
            }
        }

        // A failed unsubscribe leaves the handler live, so the entry stays
        // at zero and the next register reuses it.
        sub.count = 0;
        let handle = sub.handle;
        self.broker.unsubscribe(&channel, handle).await?;
        subs.remove(&channel);

        if let Route::Room(room_id) = &target.route {
            for listener in self.shared.listeners.read().iter() {
                listener.room_released(room_id);
            }
        }
        tracing::debug!(%channel, "channel unsubscribed");
        Ok(())
    }

    /// Current local reference count for `channel`.
    pub async fn subscription_count(&self, channel: &str) -> usize {
        self.subscriptions
            .lock()
            .await
            .get(channel)
            .map_or(0, |sub| sub.count)
    }

    /// Release every subscription.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, ChannelSubscription)> =
            self.subscriptions.lock().await.drain().collect();
        for (channel, sub) in drained {
            if let Err(err) = self.broker.unsubscribe(&channel, sub.handle).await {
                tracing::warn!(%channel, ?err, "unsubscribe during shutdown failed");
            }
        }
    }
}
