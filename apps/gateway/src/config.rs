use std::time::Duration;

/// How access tokens are verified.
#[derive(Debug, Clone)]
pub enum TokenKey {
    /// PEM-encoded RSA public key (RS256).
    RsaPem(String),
    /// Shared secret (HS256).
    Secret(String),
}

/// Gateway configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Redis connection string. Unset runs on an in-process store, which
    /// only works for a single gateway process.
    pub redis_url: Option<String>,
    /// PostgreSQL connection string for the room/user directory. Unset
    /// uses an empty in-memory directory.
    pub database_url: Option<String>,
    pub token_key: TokenKey,
    /// Port the HTTP server binds to.
    pub port: u16,
    /// How long a disconnected session stays resumable.
    pub session_expiry: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if neither `JWT_PUBLIC_KEY` nor
    /// `JWT_SECRET` is set.
    pub fn from_env() -> Self {
        let token_key = match (optional_var("JWT_PUBLIC_KEY"), optional_var("JWT_SECRET")) {
            (Some(pem), _) => TokenKey::RsaPem(pem),
            (None, Some(secret)) => TokenKey::Secret(secret),
            (None, None) => panic!("JWT_PUBLIC_KEY or JWT_SECRET env var is required"),
        };

        Self {
            redis_url: optional_var("REDIS_URL"),
            database_url: optional_var("DATABASE_URL"),
            token_key,
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(9000),
            session_expiry: Duration::from_secs(
                std::env::var("SESSION_EXPIRY_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(300),
            ),
        }
    }

    /// Single-process configuration used by tests.
    pub fn local(secret: &str) -> Self {
        Self {
            redis_url: None,
            database_url: None,
            token_key: TokenKey::Secret(secret.to_string()),
            port: 0,
            session_expiry: Duration::from_secs(300),
        }
    }
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}
