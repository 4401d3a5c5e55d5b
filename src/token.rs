//! Signed access tokens for token-restricted key delivery.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};

use crate::config::TokenConfig;
use crate::error::Result;

/// Claim the key delivery service checks against the requested content key
pub const CONTENT_KEY_IDENTIFIER_CLAIM: &str = "urn:microsoft:azure:mediaservices:contentkeyidentifier";

const NOT_BEFORE_SKEW_MINUTES: i64 = 5;
const LIFETIME_MINUTES: i64 = 60;

#[derive(Debug, Serialize, Deserialize)]
pub struct ContentKeyClaims {
    pub iss: String,
    pub aud: String,
    pub nbf: i64,
    pub exp: i64,
    #[serde(rename = "urn:microsoft:azure:mediaservices:contentkeyidentifier")]
    pub content_key_id: String,
}

/// Issues HS256 tokens with a symmetric key shared with the key delivery service
#[derive(Clone)]
pub struct TokenIssuer {
    issuer: String,
    audience: String,
    signing_key: Vec<u8>,
}

impl TokenIssuer {
    pub fn new(issuer: impl Into<String>, audience: impl Into<String>, signing_key: Vec<u8>) -> Self {
        Self {
            issuer: issuer.into(),
            audience: audience.into(),
            signing_key,
        }
    }

    pub fn from_config(config: &TokenConfig) -> Result<Self> {
        Ok(Self::new(&config.issuer, &config.audience, config.signing_key()?))
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    pub fn signing_key(&self) -> &[u8] {
        &self.signing_key
    }

    pub fn generate(&self, content_key_id: &str) -> Result<String> {
        self.generate_at(content_key_id, Utc::now())
    }

    /// Token valid from five minutes before `issued_at` until an hour after it
    pub fn generate_at(&self, content_key_id: &str, issued_at: DateTime<Utc>) -> Result<String> {
        let claims = ContentKeyClaims {
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            nbf: (issued_at - Duration::minutes(NOT_BEFORE_SKEW_MINUTES)).timestamp(),
            exp: (issued_at + Duration::minutes(LIFETIME_MINUTES)).timestamp(),
            content_key_id: content_key_id.to_string(),
        };

        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(&self.signing_key),
        )?;

        Ok(token)
    }
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .finish_non_exhaustive()
    }
}

pub fn generate_access_token(issuer: &str, audience: &str, content_key_id: &str, signing_key: &[u8]) -> Result<String> {
    TokenIssuer::new(issuer, audience, signing_key.to_vec()).generate(content_key_id)
}
