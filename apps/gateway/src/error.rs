use thiserror::Error;

/// Failure raised anywhere inside the gateway core.
///
/// Handlers never surface these to clients directly: the router either
/// closes the connection ([`GatewayError::is_fatal`]) or logs the error under
/// an id and sends that id in an `ERROR` envelope.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("shared store error: {0}")]
    Store(String),

    #[error("entity directory error: {0}")]
    Directory(String),

    #[error("publish to {channel} failed: {reason}")]
    Publish { channel: String, reason: String },

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("session {session_id} is owned by another user")]
    Hijack { session_id: String },

    #[error("connection is closed")]
    Send,
}

impl GatewayError {
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    pub fn directory(message: impl Into<String>) -> Self {
        Self::Directory(message.into())
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    pub fn publish(channel: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Publish {
            channel: channel.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the connection must be closed instead of receiving an error envelope.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::Hijack { .. } | Self::Send)
    }
}

impl From<redis::RedisError> for GatewayError {
    fn from(err: redis::RedisError) -> Self {
        tracing::error!(?err, "redis error");
        Self::Store(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialize(err.to_string())
    }
}

impl From<diesel::result::Error> for GatewayError {
    fn from(err: diesel::result::Error) -> Self {
        tracing::error!(?err, "database error");
        Self::Directory(err.to_string())
    }
}

impl From<diesel_async::pooled_connection::deadpool::PoolError> for GatewayError {
    fn from(err: diesel_async::pooled_connection::deadpool::PoolError) -> Self {
        tracing::error!(?err, "pool error");
        Self::Directory(err.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for GatewayError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Self::Auth(err.to_string())
    }
}
