use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::auth::ClientSecretCredential;
use crate::config::AccountConfig;
use crate::error::{MediaJobError, Result};

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Authenticated client for one media services account on the resource manager API
pub struct ArmClient {
    client: Client,
    account_url: String,
    api_version: String,
    credential: ClientSecretCredential,
}

impl ArmClient {
    pub fn new(account: &AccountConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()?;

        let account_url = format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Media/mediaServices/{}",
            account.arm_endpoint.trim_end_matches('/'),
            account.subscription_id,
            account.resource_group,
            account.account_name
        );

        Ok(Self {
            credential: ClientSecretCredential::new(client.clone(), account),
            client,
            account_url,
            api_version: account.api_version.clone(),
        })
    }

    /// Plain HTTP client, shared with the blob transfers
    pub fn http(&self) -> &Client {
        &self.client
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}?api-version={}", self.account_url, path, self.api_version)
    }

    async fn request(&self, method: Method, url: &str) -> Result<RequestBuilder> {
        let token = self.credential.bearer_token().await?;
        Ok(self.client.request(method, url).bearer_auth(token))
    }

    /// GET a resource, mapping 404 to `None`
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        self.get_url(&self.url(path)).await
    }

    /// GET an absolute URL such as an `@odata.nextLink`
    pub async fn get_url<T: DeserializeOwned>(&self, url: &str) -> Result<Option<T>> {
        debug!("GET {}", url);
        let response = self.request(Method::GET, url).await?.send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let response = check(response).await?;
        Ok(Some(response.json().await?))
    }

    /// GET a resource that has to exist
    pub async fn get_required<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.get(path).await?.ok_or_else(|| {
            MediaJobError::remote("ResourceNotFound", format!("{} does not exist", path))
        })
    }

    pub async fn put<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = self.url(path);
        debug!("PUT {}", url);
        let response = self.request(Method::PUT, &url).await?.json(body).send().await?;
        let response = check(response).await?;
        Ok(response.json().await?)
    }

    pub async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = self.url(path);
        debug!("POST {}", url);
        let response = self.request(Method::POST, &url).await?.json(body).send().await?;
        let response = check(response).await?;
        Ok(response.json().await?)
    }

    /// POST an action whose response body is not needed
    pub async fn post_action(&self, path: &str) -> Result<()> {
        let url = self.url(path);
        debug!("POST {}", url);
        let response = self.request(Method::POST, &url).await?
            .header(reqwest::header::CONTENT_LENGTH, 0)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    /// DELETE a resource; deleting something already gone succeeds
    pub async fn delete(&self, path: &str) -> Result<()> {
        let url = self.url(path);
        debug!("DELETE {}", url);
        let response = self.request(Method::DELETE, &url).await?.send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }

        check(response).await?;
        Ok(())
    }
}

async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(parse_error(status, &body))
}

fn parse_error(status: StatusCode, body: &str) -> MediaJobError {
    match serde_json::from_str::<ErrorResponse>(body) {
        Ok(err) => MediaJobError::remote(err.error.code, err.error.message),
        Err(_) => MediaJobError::remote(
            status.as_u16().to_string(),
            status.canonical_reason().unwrap_or("unexpected response").to_string(),
        ),
    }
}
