//! Access-token verification for the AUTHENTICATE handshake.

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// Claims carried by gateway access tokens.
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenClaims {
    /// The user id.
    pub id: String,
    /// Expiration (unix timestamp).
    pub exp: i64,
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Returns the verified user id.
    async fn verify(&self, token: &str) -> Result<String, GatewayError>;
}

/// Verifies JWTs issued by the account service.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// RS256 verification against a PEM-encoded public key.
    pub fn from_rsa_pem(pem: &str) -> Result<Self, GatewayError> {
        let key = DecodingKey::from_rsa_pem(pem.as_bytes())?;
        Ok(Self {
            key,
            validation: Validation::new(Algorithm::RS256),
        })
    }

    /// HS256 verification with a shared secret (development and tests).
    pub fn from_secret(secret: &[u8]) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<String, GatewayError> {
        if token.is_empty() {
            return Err(GatewayError::auth("empty token"));
        }
        let data = jsonwebtoken::decode::<TokenClaims>(token, &self.key, &self.validation)?;
        Ok(data.claims.id)
    }
}
