use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::AccountConfig;
use crate::error::{MediaJobError, Result};

/// Refresh this long before the token actually expires
const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: String,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(EXPIRY_MARGIN_SECS) < self.expires_at
    }
}

/// Azure AD client-credential flow for the resource manager audience
pub struct ClientSecretCredential {
    client: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    scope: String,
    cached: Mutex<Option<CachedToken>>,
}

impl ClientSecretCredential {
    pub fn new(client: Client, account: &AccountConfig) -> Self {
        let token_url = format!(
            "{}/{}/oauth2/v2.0/token",
            account.aad_endpoint.trim_end_matches('/'),
            account.tenant_id
        );
        let scope = format!("{}/.default", account.arm_audience.trim_end_matches('/'));

        Self {
            client,
            token_url,
            client_id: account.client_id.clone(),
            client_secret: account.client_secret.clone(),
            scope,
            cached: Mutex::new(None),
        }
    }

    /// Return a bearer token, requesting a new one when the cached token is about to expire
    pub async fn bearer_token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref() {
            if token.is_fresh(Utc::now()) {
                return Ok(token.value.clone());
            }
        }

        debug!("Requesting management token from {}", self.token_url);

        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", self.scope.as_str()),
        ];

        let response = self.client
            .post(&self.token_url)
            .form(&form)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(match serde_json::from_str::<TokenErrorResponse>(&body) {
                Ok(err) => MediaJobError::remote(err.error, err.error_description),
                Err(_) => MediaJobError::remote(status.as_u16().to_string(), body),
            });
        }

        let token: TokenResponse = response.json().await?;
        let fresh = CachedToken {
            value: token.access_token,
            expires_at: Utc::now() + Duration::seconds(token.expires_in),
        };

        let value = fresh.value.clone();
        *cached = Some(fresh);
        Ok(value)
    }
}
