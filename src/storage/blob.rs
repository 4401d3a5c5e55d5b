use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, Response, Url};
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use super::{listing, AssetStore};
use crate::error::{MediaJobError, Result};
use crate::model::{AccessPermission, Asset, ObjectPage};
use crate::service::ArmClient;

const BLOB_API_VERSION: &str = "2020-10-02";

/// Files up to this size go up in one request; larger ones are sent as blocks of this size
const BLOCK_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct AssetResource {
    name: String,
    #[serde(default)]
    properties: AssetProperties,
}

#[derive(Debug, Default, Deserialize)]
struct AssetProperties {
    #[serde(default)]
    container: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerSas {
    #[serde(default)]
    asset_container_sas_urls: Vec<String>,
}

/// Asset store backed by the media services asset API and Azure blob storage
pub struct AzureAssetStore {
    arm: Arc<ArmClient>,
}

impl AzureAssetStore {
    pub fn new(arm: Arc<ArmClient>) -> Self {
        Self { arm }
    }

    fn http(&self) -> &Client {
        self.arm.http()
    }
}

#[async_trait]
impl AssetStore for AzureAssetStore {
    async fn get_asset(&self, name: &str) -> Result<Option<Asset>> {
        let resource: Option<AssetResource> = self.arm.get(&format!("assets/{}", name)).await?;
        Ok(resource.map(asset_from_wire))
    }

    async fn create_or_update_asset(&self, name: &str) -> Result<Asset> {
        let resource: AssetResource = self
            .arm
            .put(&format!("assets/{}", name), &json!({ "properties": {} }))
            .await?;

        Ok(asset_from_wire(resource))
    }

    async fn delete_asset(&self, name: &str) -> Result<()> {
        self.arm.delete(&format!("assets/{}", name)).await
    }

    async fn issue_access_grant(
        &self,
        name: &str,
        permission: AccessPermission,
        expiry: DateTime<Utc>,
    ) -> Result<Url> {
        let body = json!({
            "permissions": match permission {
                AccessPermission::Read => "Read",
                AccessPermission::ReadWrite => "ReadWrite",
            },
            "expiryTime": expiry.to_rfc3339_opts(SecondsFormat::Secs, true),
        });

        let sas: ContainerSas = self
            .arm
            .post(&format!("assets/{}/listContainerSas", name), &body)
            .await?;

        let url = sas.asset_container_sas_urls.into_iter().next().ok_or_else(|| {
            MediaJobError::Storage(format!("No container URL was granted for asset {}", name))
        })?;

        Url::parse(&url).map_err(|e| MediaJobError::Storage(format!("Invalid container URL: {}", e)))
    }

    async fn list_objects(&self, container: &Url, continuation: Option<String>) -> Result<ObjectPage> {
        let mut url = container.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("restype", "container").append_pair("comp", "list");
            if let Some(marker) = &continuation {
                query.append_pair("marker", marker);
            }
        }

        debug!("Listing container {}", redact(container));
        let response = self.http()
            .get(url)
            .header("x-ms-version", BLOB_API_VERSION)
            .send()
            .await?;

        let body = check(response).await?.text().await?;
        Ok(listing::parse_list_response(&body))
    }

    async fn upload_object(&self, container: &Url, object_name: &str, local_path: &Path) -> Result<()> {
        let size = fs::metadata(local_path).await?.len();
        debug!("Uploading {} ({} bytes) as {}", local_path.display(), size, object_name);

        if size <= BLOCK_SIZE as u64 {
            let data = fs::read(local_path).await?;
            let response = self.http()
                .put(object_url(container, object_name)?)
                .header("x-ms-version", BLOB_API_VERSION)
                .header("x-ms-blob-type", "BlockBlob")
                .body(data)
                .send()
                .await?;

            check(response).await?;
            return Ok(());
        }

        let mut file = fs::File::open(local_path).await?;
        let mut buffer = vec![0u8; BLOCK_SIZE];
        let mut block_ids = Vec::new();

        loop {
            let read = read_block(&mut file, &mut buffer).await?;
            if read == 0 {
                break;
            }

            let id = block_id(block_ids.len());
            let response = self.http()
                .put(block_url(container, object_name, &id)?)
                .header("x-ms-version", BLOB_API_VERSION)
                .body(buffer[..read].to_vec())
                .send()
                .await?;
            check(response).await?;

            block_ids.push(id);
        }

        debug!("Committing {} blocks for {}", block_ids.len(), object_name);
        let response = self.http()
            .put(block_list_url(container, object_name)?)
            .header("x-ms-version", BLOB_API_VERSION)
            .header(reqwest::header::CONTENT_TYPE, "application/xml")
            .body(block_list_body(&block_ids))
            .send()
            .await?;

        check(response).await?;
        Ok(())
    }

    async fn download_object(&self, container: &Url, object_name: &str, local_path: &Path) -> Result<()> {
        let response = self.http()
            .get(object_url(container, object_name)?)
            .header("x-ms-version", BLOB_API_VERSION)
            .send()
            .await?;
        let response = check(response).await?;

        let result = write_body(response, local_path).await;
        if result.is_err() {
            remove_partial(local_path).await;
        } else {
            debug!("Downloaded {} to {}", object_name, local_path.display());
        }
        result
    }
}

async fn write_body(mut response: Response, local_path: &Path) -> Result<()> {
    let mut file = fs::File::create(local_path).await?;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(())
}

/// Remove a file left behind by an interrupted download
async fn remove_partial(local_path: &Path) {
    if let Err(e) = fs::remove_file(local_path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove partial download {}: {}", local_path.display(), e);
        }
    }
}

/// Fill `buffer` from `reader`, returning fewer bytes only at end of input
async fn read_block<R: AsyncRead + Unpin>(reader: &mut R, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let read = reader.read(&mut buffer[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

/// Block ids must all have the same length within a blob
fn block_id(index: usize) -> String {
    base64::engine::general_purpose::STANDARD.encode(format!("block-{:08}", index))
}

fn block_url(container: &Url, object_name: &str, block_id: &str) -> Result<Url> {
    let mut url = object_url(container, object_name)?;
    url.query_pairs_mut()
        .append_pair("comp", "block")
        .append_pair("blockid", block_id);
    Ok(url)
}

fn block_list_url(container: &Url, object_name: &str) -> Result<Url> {
    let mut url = object_url(container, object_name)?;
    url.query_pairs_mut().append_pair("comp", "blocklist");
    Ok(url)
}

fn block_list_body(block_ids: &[String]) -> String {
    let mut body = String::from(r#"<?xml version="1.0" encoding="utf-8"?><BlockList>"#);
    for id in block_ids {
        body.push_str("<Latest>");
        body.push_str(id);
        body.push_str("</Latest>");
    }
    body.push_str("</BlockList>");
    body
}

fn asset_from_wire(resource: AssetResource) -> Asset {
    Asset {
        name: resource.name,
        container: resource.properties.container,
    }
}

/// Append an object name to a container SAS URL, keeping the SAS query
fn object_url(container: &Url, object_name: &str) -> Result<Url> {
    let mut url = container.clone();
    url.path_segments_mut()
        .map_err(|_| MediaJobError::Storage(format!("Container URL cannot hold objects: {}", redact(container))))?
        .pop_if_empty()
        .extend(object_name.split('/'));
    Ok(url)
}

/// Container URL without its SAS signature, for logging
fn redact(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}

async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let code = response
        .headers()
        .get("x-ms-error-code")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| status.as_u16().to_string());
    let message = status.canonical_reason().unwrap_or("blob request failed").to_string();

    Err(MediaJobError::remote(code, message))
}
