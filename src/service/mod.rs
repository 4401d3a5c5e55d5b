// Remote job orchestration service
//
// - auth: Azure AD client-credential tokens
// - arm: authenticated resource manager requests for one account
// - client: job service implementation on top of the REST API

pub mod arm;
pub mod auth;
pub mod client;

use async_trait::async_trait;
use std::sync::Arc;

pub use arm::ArmClient;
pub use client::ArmJobService;

use crate::error::Result;
use crate::model::{
    Job, JobInput, KeyPolicy, StreamingEndpoint, StreamingGrant, StreamingPath, StreamingPolicy,
    TransformDefinition,
};

/// Operations consumed from the job orchestration service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobService: Send + Sync {
    /// Look up a transform; `None` when it does not exist
    async fn get_transform(&self, name: &str) -> Result<Option<TransformDefinition>>;

    async fn create_or_update_transform(&self, transform: &TransformDefinition) -> Result<TransformDefinition>;

    async fn create_job(
        &self,
        transform_name: &str,
        job_name: &str,
        input: &JobInput,
        output_asset_names: &[String],
    ) -> Result<Job>;

    async fn get_job(&self, transform_name: &str, job_name: &str) -> Result<Job>;

    async fn cancel_job(&self, transform_name: &str, job_name: &str) -> Result<()>;

    async fn delete_job(&self, transform_name: &str, job_name: &str) -> Result<()>;

    async fn list_jobs(&self, transform_name: &str) -> Result<Vec<Job>>;

    async fn get_key_policy(&self, name: &str) -> Result<Option<KeyPolicy>>;

    async fn create_or_update_key_policy(&self, policy: &KeyPolicy) -> Result<KeyPolicy>;

    async fn delete_key_policy(&self, name: &str) -> Result<()>;

    /// Create a streaming locator; paths are filled in separately
    async fn create_streaming_grant(
        &self,
        grant_name: &str,
        asset_name: &str,
        policy: StreamingPolicy,
        key_policy_name: Option<String>,
    ) -> Result<StreamingGrant>;

    /// Playback paths of a grant, relative to the endpoint host
    async fn list_streaming_paths(&self, grant_name: &str) -> Result<Vec<StreamingPath>>;

    async fn get_endpoint(&self, name: &str) -> Result<StreamingEndpoint>;

    async fn start_endpoint(&self, name: &str) -> Result<()>;
}

/// Factory for creating job service instances
pub struct JobServiceFactory;

impl JobServiceFactory {
    /// Create the REST-backed job service
    pub fn create_service(arm: Arc<ArmClient>) -> Box<dyn JobService> {
        Box::new(client::ArmJobService::new(arm))
    }
}
