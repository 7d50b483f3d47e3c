//! Cross-process message transport on top of the shared store's pub/sub.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::events::Envelope;
use super::target::MessageTarget;
use crate::db::pubsub::{PubSub, SubscriptionId};
use crate::error::GatewayError;

/// What travels between gateway processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerMessage {
    /// Node id of the publishing process.
    pub origin: String,
    pub target: MessageTarget,
    pub message: Envelope,
}

pub type BrokerHandler = Arc<dyn Fn(BrokerMessage) + Send + Sync>;

#[derive(Clone)]
pub struct Broker {
    pubsub: Arc<dyn PubSub>,
}

impl Broker {
    pub fn new(pubsub: Arc<dyn PubSub>) -> Self {
        Self { pubsub }
    }

    /// Returns the number of processes that received the message.
    pub async fn publish(&self, channel: &str, message: &BrokerMessage) -> Result<usize, GatewayError> {
        let payload = serde_json::to_string(message)?;
        self.pubsub.publish(channel, &payload).await
    }

    /// Undecodable payloads are logged and dropped.
    pub async fn subscribe(
        &self,
        channel: &str,
        handler: BrokerHandler,
    ) -> Result<SubscriptionId, GatewayError> {
        let name = channel.to_string();
        self.pubsub
            .subscribe(
                channel,
                Arc::new(move |raw: &str| match serde_json::from_str::<BrokerMessage>(raw) {
                    Ok(message) => handler(message),
                    Err(err) => {
                        tracing::warn!(channel = %name, ?err, "dropping malformed broker message")
                    }
                }),
            )
            .await
    }

    pub async fn unsubscribe(&self, channel: &str, id: SubscriptionId) -> Result<(), GatewayError> {
        self.pubsub.unsubscribe(channel, id).await
    }
}
