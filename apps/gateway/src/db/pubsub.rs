use std::sync::Arc;

use async_trait::async_trait;

use crate::error::GatewayError;

/// Callback invoked with the raw payload of every message on a channel.
pub type MessageHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Identifies one handler registered on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Publish/subscribe half of the shared store.
///
/// Delivery is at-most-once per subscriber and unordered across channels.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Returns the number of subscribers that received the message.
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, GatewayError>;

    async fn subscribe(
        &self,
        channel: &str,
        handler: MessageHandler,
    ) -> Result<SubscriptionId, GatewayError>;

    async fn unsubscribe(&self, channel: &str, id: SubscriptionId) -> Result<(), GatewayError>;
}
