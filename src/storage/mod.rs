// Remote asset storage
//
// Asset records and access grants live on the management API; the objects
// themselves are moved with the blob REST API through the granted container URL.

pub mod blob;
pub mod listing;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Url;
use std::path::Path;
use std::sync::Arc;

pub use blob::AzureAssetStore;

use crate::error::Result;
use crate::model::{AccessPermission, Asset, ObjectPage};
use crate::service::ArmClient;

/// Operations consumed from the asset store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Look up an asset record; `None` when it does not exist
    async fn get_asset(&self, name: &str) -> Result<Option<Asset>>;

    async fn create_or_update_asset(&self, name: &str) -> Result<Asset>;

    async fn delete_asset(&self, name: &str) -> Result<()>;

    /// Time-limited URL granting access to the asset's container
    async fn issue_access_grant(
        &self,
        name: &str,
        permission: AccessPermission,
        expiry: DateTime<Utc>,
    ) -> Result<Url>;

    /// One page of object names; pass the previous page's continuation to get the next
    async fn list_objects(&self, container: &Url, continuation: Option<String>) -> Result<ObjectPage>;

    async fn upload_object(&self, container: &Url, object_name: &str, local_path: &Path) -> Result<()>;

    async fn download_object(&self, container: &Url, object_name: &str, local_path: &Path) -> Result<()>;
}

/// Factory for creating asset store instances
pub struct AssetStoreFactory;

impl AssetStoreFactory {
    /// Create the Azure-backed asset store
    pub fn create_store(arm: Arc<ArmClient>) -> Box<dyn AssetStore> {
        Box::new(blob::AzureAssetStore::new(arm))
    }
}
