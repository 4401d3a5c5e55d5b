use chrono::Utc;
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::WorkflowConfig;
use crate::error::{MediaJobError, Result};
use crate::model::{
    AccessPermission, Asset, Job, JobInput, JobState, KeyPolicy, StreamingEndpoint, StreamingGrant,
    StreamingPath, StreamingPolicy, TransformDefinition, TransformOutput,
};
use crate::service::JobService;
use crate::storage::AssetStore;

/// Streaming endpoint every media services account is created with
pub const DEFAULT_STREAMING_ENDPOINT: &str = "default";

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Give up on a job that is still running after this long; `None` polls forever
    pub timeout: Option<Duration>,
    /// Consecutive transport errors tolerated while polling
    pub transient_poll_retries: u32,
    /// Validity window of container access grants
    pub grant_validity: chrono::Duration,
    pub download_concurrency: usize,
    /// Interval between checks while a streaming endpoint starts
    pub endpoint_poll_interval: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            transient_poll_retries: 0,
            grant_validity: chrono::Duration::hours(1),
            download_concurrency: 8,
            endpoint_poll_interval: Duration::from_secs(10),
        }
    }
}

impl From<&WorkflowConfig> for OrchestratorOptions {
    fn from(config: &WorkflowConfig) -> Self {
        Self {
            timeout: config.timeout(),
            transient_poll_retries: config.transient_poll_retries,
            grant_validity: config.grant_validity(),
            download_concurrency: config.download_concurrency.max(1),
            endpoint_poll_interval: config.poll_interval(),
        }
    }
}

/// Fresh suffix used to keep generated resource names unique
pub fn unique_suffix() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Drives one job from submission to a terminal state and exposes its output
pub struct JobOrchestrator {
    jobs: Box<dyn JobService>,
    store: Box<dyn AssetStore>,
    options: OrchestratorOptions,
}

impl JobOrchestrator {
    pub fn new(jobs: Box<dyn JobService>, store: Box<dyn AssetStore>, options: OrchestratorOptions) -> Self {
        Self { jobs, store, options }
    }

    /// Return the named transform, creating it with `outputs` when it does not exist.
    ///
    /// An existing transform is assumed to use the same recipe; its outputs are not compared.
    pub async fn get_or_create_transform(
        &self,
        name: &str,
        outputs: Vec<TransformOutput>,
    ) -> Result<TransformDefinition> {
        if let Some(existing) = self.jobs.get_transform(name).await? {
            debug!("Reusing transform {}", name);
            return Ok(existing);
        }

        info!("Transform {} not found, creating it", name);
        let transform = TransformDefinition {
            name: name.to_string(),
            outputs,
        };
        self.jobs.create_or_update_transform(&transform).await
    }

    /// Create (or overwrite) an asset and upload a local file into it under its base filename
    pub async fn create_input_asset(&self, name: &str, local_file: &Path) -> Result<Asset> {
        if !local_file.is_file() {
            return Err(MediaJobError::FileNotFound(local_file.display().to_string()));
        }

        let file_name = local_file
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| MediaJobError::Config(format!("Invalid input filename: {}", local_file.display())))?;

        let asset = self.store.create_or_update_asset(name).await?;

        let expiry = Utc::now() + self.options.grant_validity;
        let container = self
            .store
            .issue_access_grant(&asset.name, AccessPermission::ReadWrite, expiry)
            .await?;

        info!("Uploading {} to asset {}", local_file.display(), asset.name);
        self.store.upload_object(&container, file_name, local_file).await?;

        Ok(asset)
    }

    /// Create an empty output asset, renaming instead of overwriting on a name collision.
    ///
    /// The returned asset's name may differ from `desired_name`.
    pub async fn create_output_asset(&self, desired_name: &str) -> Result<Asset> {
        let name = match self.store.get_asset(desired_name).await? {
            Some(_) => {
                let renamed = format!("{}-{}", desired_name, unique_suffix());
                warn!("Found an existing asset with name {}", desired_name);
                warn!("Creating an asset with this name instead: {}", renamed);
                renamed
            }
            None => desired_name.to_string(),
        };

        self.store.create_or_update_asset(&name).await
    }

    pub async fn submit_job(
        &self,
        transform_name: &str,
        job_name: &str,
        input: &JobInput,
        output_asset_names: &[String],
    ) -> Result<Job> {
        info!("Submitting job {} to transform {}", job_name, transform_name);
        self.jobs
            .create_job(transform_name, job_name, input, output_asset_names)
            .await
    }

    /// Poll the job every `poll_interval` until it reaches Finished, Error or Canceled
    pub async fn wait_for_completion(
        &self,
        transform_name: &str,
        job_name: &str,
        poll_interval: Duration,
    ) -> Result<Job> {
        let started = Instant::now();
        let mut transport_failures = 0u32;

        loop {
            let job = match self.jobs.get_job(transform_name, job_name).await {
                Ok(job) => {
                    transport_failures = 0;
                    job
                }
                Err(e) if e.is_transient() && transport_failures < self.options.transient_poll_retries => {
                    transport_failures += 1;
                    warn!(
                        "Polling job {} failed ({}/{}): {}",
                        job_name, transport_failures, self.options.transient_poll_retries, e
                    );
                    sleep(poll_interval).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            report_progress(&job);

            if job.state.is_terminal() {
                return Ok(job);
            }

            if let Some(timeout) = self.options.timeout {
                let waited = started.elapsed();
                if waited >= timeout {
                    warn!("Job {} timed out after {:?}", job_name, waited);
                    return Err(MediaJobError::TimedOut {
                        resource: format!("job {}", job_name),
                        waited,
                    });
                }
            }

            sleep(poll_interval).await;
        }
    }

    /// Ask the service to cancel a job; a later poll observes `Canceled`
    pub async fn cancel_job(&self, transform_name: &str, job_name: &str) -> Result<()> {
        info!("Canceling job {}", job_name);
        self.jobs.cancel_job(transform_name, job_name).await
    }

    pub async fn list_jobs(&self, transform_name: &str) -> Result<Vec<Job>> {
        self.jobs.list_jobs(transform_name).await
    }

    /// Download every object of an asset into `destination/<asset_name>/`.
    ///
    /// Returns once all downloads have finished; fails if any of them failed.
    pub async fn download_output_asset(&self, asset_name: &str, destination: &Path) -> Result<PathBuf> {
        if !destination.is_dir() {
            return Err(MediaJobError::FileNotFound(destination.display().to_string()));
        }

        let expiry = Utc::now() + self.options.grant_validity;
        let container = self
            .store
            .issue_access_grant(asset_name, AccessPermission::Read, expiry)
            .await?;

        let directory = destination.join(asset_name);
        fs::create_dir_all(&directory).await?;

        let mut names = Vec::new();
        let mut continuation = None;
        loop {
            let page = self.store.list_objects(&container, continuation.take()).await?;
            names.extend(page.names);
            match page.continuation {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }

        info!("Downloading {} objects to {}", names.len(), directory.display());

        let pb = ProgressBar::new(names.len() as u64);
        pb.set_style(
            ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );

        let container = &container;
        let directory_ref = directory.as_path();
        let pb_ref = &pb;
        let results: Vec<(String, Result<()>)> = stream::iter(names)
            .map(|name| async move {
                let result = self.download_one(container, directory_ref, &name).await;
                pb_ref.inc(1);
                (name, result)
            })
            .buffer_unordered(self.options.download_concurrency.max(1))
            .collect()
            .await;

        pb.finish_and_clear();

        let total = results.len();
        let failed: Vec<String> = results
            .into_iter()
            .filter_map(|(name, result)| match result {
                Ok(()) => None,
                Err(e) => {
                    warn!("Failed to download {}: {}", name, e);
                    Some(name)
                }
            })
            .collect();

        if !failed.is_empty() {
            return Err(MediaJobError::Storage(format!(
                "{} of {} objects failed to download from asset {}",
                failed.len(),
                total,
                asset_name
            )));
        }

        info!("Download complete");
        Ok(directory)
    }

    async fn download_one(&self, container: &reqwest::Url, directory: &Path, name: &str) -> Result<()> {
        let target = local_object_path(directory, name)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        self.store.download_object(container, name, &target).await
    }

    /// Publish an output asset for streaming and resolve its playback URLs.
    ///
    /// With a key policy, the policy is ensured first so key delivery requires a signed token.
    pub async fn create_streaming_grant(
        &self,
        asset_name: &str,
        grant_name: &str,
        policy: StreamingPolicy,
        key_policy: Option<&KeyPolicy>,
    ) -> Result<StreamingGrant> {
        if let Some(key_policy) = key_policy {
            self.get_or_create_key_policy(key_policy).await?;
        }

        let mut grant = self
            .jobs
            .create_streaming_grant(grant_name, asset_name, policy, key_policy.map(|p| p.name.clone()))
            .await?;

        let mut endpoint = self.jobs.get_endpoint(DEFAULT_STREAMING_ENDPOINT).await?;
        if !endpoint.running {
            self.jobs.start_endpoint(DEFAULT_STREAMING_ENDPOINT).await?;
            endpoint = self.wait_for_endpoint(DEFAULT_STREAMING_ENDPOINT).await?;
        }

        grant.paths = self
            .jobs
            .list_streaming_paths(grant_name)
            .await?
            .into_iter()
            .map(|path| StreamingPath {
                protocol: path.protocol,
                url: format!("https://{}{}", endpoint.host_name, path.url),
            })
            .collect();

        Ok(grant)
    }

    /// Poll a starting endpoint until it reports running, within the configured timeout
    async fn wait_for_endpoint(&self, name: &str) -> Result<StreamingEndpoint> {
        let started = Instant::now();

        loop {
            let endpoint = self.jobs.get_endpoint(name).await?;
            if endpoint.running {
                info!("Streaming endpoint {} is running", name);
                return Ok(endpoint);
            }

            if let Some(timeout) = self.options.timeout {
                let waited = started.elapsed();
                if waited >= timeout {
                    return Err(MediaJobError::TimedOut {
                        resource: format!("streaming endpoint {}", name),
                        waited,
                    });
                }
            }

            debug!("Waiting for streaming endpoint {} to start", name);
            sleep(self.options.endpoint_poll_interval).await;
        }
    }

    async fn get_or_create_key_policy(&self, policy: &KeyPolicy) -> Result<KeyPolicy> {
        if let Some(existing) = self.jobs.get_key_policy(&policy.name).await? {
            debug!("Reusing content key policy {}", policy.name);
            return Ok(existing);
        }

        self.jobs.create_or_update_key_policy(policy).await
    }

    /// Delete the job, then each asset, then the key policy.
    ///
    /// Every deletion is attempted even when an earlier one fails.
    pub async fn cleanup(
        &self,
        transform_name: &str,
        job_name: &str,
        asset_names: &[String],
        key_policy_name: Option<&str>,
    ) -> Result<()> {
        let mut failed = Vec::new();

        if let Err(e) = self.jobs.delete_job(transform_name, job_name).await {
            warn!("Failed to delete job {}: {}", job_name, e);
            failed.push(format!("job {}", job_name));
        }

        for asset_name in asset_names {
            if let Err(e) = self.store.delete_asset(asset_name).await {
                warn!("Failed to delete asset {}: {}", asset_name, e);
                failed.push(format!("asset {}", asset_name));
            }
        }

        if let Some(policy) = key_policy_name {
            if let Err(e) = self.jobs.delete_key_policy(policy).await {
                warn!("Failed to delete content key policy {}: {}", policy, e);
                failed.push(format!("content key policy {}", policy));
            }
        }

        if failed.is_empty() {
            info!("Cleanup completed");
            Ok(())
        } else {
            Err(MediaJobError::Cleanup { failed })
        }
    }
}

fn report_progress(job: &Job) {
    info!("Job {} is '{}'", job.name, job.state);
    for (i, output) in job.outputs.iter().enumerate() {
        match (output.state, output.progress) {
            (JobState::Processing, Some(progress)) => {
                info!("\tJobOutput[{}] is '{}'. Progress (%): '{}'", i, output.state, progress)
            }
            _ => info!("\tJobOutput[{}] is '{}'", i, output.state),
        }
        if let Some(error) = &output.error {
            warn!("\tJobOutput[{}] error: {}", i, error);
        }
    }
}

/// Map an object name onto the download directory, refusing names that would escape it
fn local_object_path(directory: &Path, object_name: &str) -> Result<PathBuf> {
    let relative = Path::new(object_name);
    let safe = !object_name.is_empty()
        && relative.components().all(|c| matches!(c, Component::Normal(_)));

    if !safe {
        return Err(MediaJobError::Storage(format!(
            "Refusing to download object with unsafe name '{}'",
            object_name
        )));
    }

    Ok(directory.join(relative))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ObjectPage, Preset, StreamingProtocol};
    use crate::service::MockJobService;
    use crate::storage::MockAssetStore;
    use assert_fs::prelude::*;
    use async_trait::async_trait;
    use mockall::predicate::eq;
    use mockall::Sequence;
    use reqwest::Url;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const TICK: Duration = Duration::from_millis(1);

    fn orchestrator(jobs: MockJobService, store: MockAssetStore) -> JobOrchestrator {
        JobOrchestrator::new(Box::new(jobs), Box::new(store), OrchestratorOptions::default())
    }

    fn container() -> Url {
        Url::parse("https://acct.blob.core.windows.net/asset-1?sig=x").unwrap()
    }

    fn asset(name: &str) -> Asset {
        Asset { name: name.to_string(), container: None }
    }

    fn job(name: &str, state: JobState) -> Job {
        Job {
            name: name.to_string(),
            state,
            input: None,
            outputs: vec![crate::model::JobOutput {
                asset_name: "output-1".to_string(),
                state,
                progress: Some(if state == JobState::Finished { 100 } else { 37 }),
                error: None,
            }],
        }
    }

    fn adaptive_streaming() -> Vec<TransformOutput> {
        vec![TransformOutput::new(Preset::BuiltInEncoder {
            preset_name: "AdaptiveStreaming".to_string(),
        })]
    }

    #[tokio::test]
    async fn test_transform_created_only_once() {
        let mut jobs = MockJobService::new();
        let mut seq = Sequence::new();
        jobs.expect_get_transform()
            .with(eq("encode"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(None));
        jobs.expect_create_or_update_transform()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|t| Ok(t.clone()));
        jobs.expect_get_transform()
            .with(eq("encode"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|name| {
                Ok(Some(TransformDefinition { name: name.to_string(), outputs: adaptive_streaming() }))
            });

        let orchestrator = orchestrator(jobs, MockAssetStore::new());
        let first = orchestrator.get_or_create_transform("encode", adaptive_streaming()).await.unwrap();
        let second = orchestrator.get_or_create_transform("encode", adaptive_streaming()).await.unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_transform_lookup_error_propagates() {
        let mut jobs = MockJobService::new();
        jobs.expect_get_transform()
            .returning(|_| Err(MediaJobError::remote("AuthorizationFailed", "no access")));

        let orchestrator = orchestrator(jobs, MockAssetStore::new());
        let err = orchestrator.get_or_create_transform("encode", adaptive_streaming()).await.unwrap_err();
        assert!(matches!(err, MediaJobError::RemoteService { code, .. } if code == "AuthorizationFailed"));
    }

    #[tokio::test]
    async fn test_output_asset_collision_renames() {
        let mut store = MockAssetStore::new();
        store.expect_get_asset()
            .with(eq("output-X"))
            .times(1)
            .returning(|name| Ok(Some(asset(name))));
        store.expect_create_or_update_asset()
            .withf(|name: &str| name.starts_with("output-X-") && name.len() > "output-X-".len())
            .times(1)
            .returning(|name| Ok(asset(name)));

        let orchestrator = orchestrator(MockJobService::new(), store);
        let created = orchestrator.create_output_asset("output-X").await.unwrap();

        assert_ne!(created.name, "output-X");
        assert!(created.name.starts_with("output-X-"));
    }

    #[tokio::test]
    async fn test_output_asset_without_collision_keeps_name() {
        let mut store = MockAssetStore::new();
        store.expect_get_asset().returning(|_| Ok(None));
        store.expect_create_or_update_asset()
            .with(eq("output-Y"))
            .times(1)
            .returning(|name| Ok(asset(name)));

        let orchestrator = orchestrator(MockJobService::new(), store);
        assert_eq!(orchestrator.create_output_asset("output-Y").await.unwrap().name, "output-Y");
    }

    #[tokio::test]
    async fn test_input_asset_missing_file_fails_before_remote_calls() {
        let orchestrator = orchestrator(MockJobService::new(), MockAssetStore::new());
        let err = orchestrator
            .create_input_asset("input-1", Path::new("/definitely/not/here.mp4"))
            .await
            .unwrap_err();

        assert!(matches!(err, MediaJobError::FileNotFound(_)));
    }

    #[tokio::test]
    async fn test_input_asset_uploads_under_base_filename() {
        let temp = assert_fs::TempDir::new().unwrap();
        let input = temp.child("ignite.mp4");
        input.write_binary(b"\x00\x00\x00\x18ftypmp42").unwrap();

        let mut store = MockAssetStore::new();
        let mut seq = Sequence::new();
        store.expect_create_or_update_asset()
            .with(eq("input-1"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|name| Ok(asset(name)));
        store.expect_issue_access_grant()
            .withf(|name, permission, expiry| {
                name == "input-1" && *permission == AccessPermission::ReadWrite && *expiry > Utc::now()
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(container()));
        store.expect_upload_object()
            .withf(|_, object_name, local_path| object_name == "ignite.mp4" && local_path.ends_with("ignite.mp4"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));

        let orchestrator = orchestrator(MockJobService::new(), store);
        let created = orchestrator.create_input_asset("input-1", input.path()).await.unwrap();
        assert_eq!(created.name, "input-1");
    }

    #[tokio::test]
    async fn test_submit_job_passes_every_output() {
        let mut jobs = MockJobService::new();
        jobs.expect_create_job()
            .withf(|transform, job_name, input, outputs| {
                transform == "encode"
                    && job_name == "job-1"
                    && *input == JobInput::Http { files: vec!["https://example.com/a.mp4".to_string()] }
                    && outputs == ["output-1".to_string(), "output-2".to_string()]
            })
            .times(1)
            .returning(|_, name, _, _| Ok(job(name, JobState::Queued)));

        let orchestrator = orchestrator(jobs, MockAssetStore::new());
        let input = JobInput::Http { files: vec!["https://example.com/a.mp4".to_string()] };
        let submitted = orchestrator
            .submit_job("encode", "job-1", &input, &["output-1".to_string(), "output-2".to_string()])
            .await
            .unwrap();
        assert_eq!(submitted.state, JobState::Queued);
    }

    fn scripted_jobs(states: Vec<JobState>) -> MockJobService {
        let expected = states.len();
        let mut states = states.into_iter();
        let mut jobs = MockJobService::new();
        jobs.expect_get_job()
            .times(expected)
            .returning(move |_, name| Ok(job(name, states.next().expect("polled past the script"))));
        jobs
    }

    #[tokio::test]
    async fn test_polling_stops_on_finished() {
        let jobs = scripted_jobs(vec![
            JobState::Queued,
            JobState::Scheduled,
            JobState::Processing,
            JobState::Processing,
            JobState::Finished,
        ]);

        let orchestrator = orchestrator(jobs, MockAssetStore::new());
        let done = orchestrator.wait_for_completion("encode", "job-1", TICK).await.unwrap();
        assert_eq!(done.state, JobState::Finished);
    }

    #[tokio::test]
    async fn test_polling_stops_on_error() {
        let jobs = scripted_jobs(vec![JobState::Queued, JobState::Error]);

        let orchestrator = orchestrator(jobs, MockAssetStore::new());
        let done = orchestrator.wait_for_completion("encode", "job-1", TICK).await.unwrap();
        assert_eq!(done.state, JobState::Error);
    }

    #[tokio::test]
    async fn test_polling_stops_on_canceled() {
        let jobs = scripted_jobs(vec![JobState::Processing, JobState::Canceling, JobState::Canceled]);

        let orchestrator = orchestrator(jobs, MockAssetStore::new());
        let done = orchestrator.wait_for_completion("encode", "job-1", TICK).await.unwrap();
        assert_eq!(done.state, JobState::Canceled);
    }

    #[tokio::test]
    async fn test_polling_times_out() {
        let mut jobs = MockJobService::new();
        jobs.expect_get_job().returning(|_, name| Ok(job(name, JobState::Processing)));

        let options = OrchestratorOptions {
            timeout: Some(Duration::from_millis(20)),
            ..OrchestratorOptions::default()
        };
        let orchestrator = JobOrchestrator::new(Box::new(jobs), Box::new(MockAssetStore::new()), options);

        let err = orchestrator
            .wait_for_completion("encode", "job-1", Duration::from_millis(5))
            .await
            .unwrap_err();
        match err {
            MediaJobError::TimedOut { resource, waited } => {
                assert_eq!(resource, "job job-1");
                assert!(waited >= Duration::from_millis(20));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_polling_service_error_is_fatal() {
        let mut jobs = MockJobService::new();
        jobs.expect_get_job()
            .times(1)
            .returning(|_, _| Err(MediaJobError::remote("ResourceNotFound", "job is gone")));

        let options = OrchestratorOptions {
            transient_poll_retries: 3,
            ..OrchestratorOptions::default()
        };
        let orchestrator = JobOrchestrator::new(Box::new(jobs), Box::new(MockAssetStore::new()), options);

        let result = orchestrator.wait_for_completion("encode", "job-1", TICK).await;
        tokio_test::assert_err!(result);
    }

    fn two_page_store() -> MockAssetStore {
        let mut store = MockAssetStore::new();
        store.expect_issue_access_grant()
            .withf(|name, permission, _| name == "output-1" && *permission == AccessPermission::Read)
            .times(1)
            .returning(|_, _, _| Ok(container()));
        store.expect_list_objects()
            .withf(|_, continuation| continuation.is_none())
            .times(1)
            .returning(|_, _| {
                Ok(ObjectPage {
                    names: vec!["video_1280x720.mp4".to_string(), "manifest.ism".to_string()],
                    continuation: Some("page-2".to_string()),
                })
            });
        store.expect_list_objects()
            .withf(|_, continuation| continuation.as_deref() == Some("page-2"))
            .times(1)
            .returning(|_, _| {
                Ok(ObjectPage {
                    names: vec!["video_640x360.mp4".to_string(), "thumbs/frame_0001.jpg".to_string()],
                    continuation: None,
                })
            });
        store
    }

    #[tokio::test]
    async fn test_download_follows_continuation_and_fetches_every_object() {
        let temp = assert_fs::TempDir::new().unwrap();

        let mut store = two_page_store();
        store.expect_download_object()
            .times(4)
            .returning(|_, name, local_path| {
                std::fs::write(local_path, name.as_bytes())?;
                Ok(())
            });

        let orchestrator = orchestrator(MockJobService::new(), store);
        let directory = orchestrator.download_output_asset("output-1", temp.path()).await.unwrap();

        assert_eq!(directory, temp.path().join("output-1"));
        temp.child("output-1/video_1280x720.mp4").assert("video_1280x720.mp4");
        temp.child("output-1/manifest.ism").assert("manifest.ism");
        temp.child("output-1/video_640x360.mp4").assert("video_640x360.mp4");
        temp.child("output-1/thumbs/frame_0001.jpg").assert("thumbs/frame_0001.jpg");
    }

    #[tokio::test]
    async fn test_download_attempts_all_objects_before_failing() {
        let temp = assert_fs::TempDir::new().unwrap();

        let mut store = two_page_store();
        store.expect_download_object()
            .times(4)
            .returning(|_, name, _| {
                if name == "manifest.ism" {
                    Err(MediaJobError::remote("BlobNotFound", "gone"))
                } else {
                    Ok(())
                }
            });

        let orchestrator = orchestrator(MockJobService::new(), store);
        let err = orchestrator.download_output_asset("output-1", temp.path()).await.unwrap_err();
        assert!(matches!(err, MediaJobError::Storage(message) if message.starts_with("1 of 4")));
    }

    #[tokio::test]
    async fn test_download_requires_existing_destination() {
        let orchestrator = orchestrator(MockJobService::new(), MockAssetStore::new());
        let err = orchestrator
            .download_output_asset("output-1", Path::new("/definitely/not/here"))
            .await
            .unwrap_err();
        assert!(matches!(err, MediaJobError::FileNotFound(_)));
    }

    #[tokio::test]
    async fn test_download_skips_escaping_names() {
        let temp = assert_fs::TempDir::new().unwrap();

        let mut store = MockAssetStore::new();
        store.expect_issue_access_grant().returning(|_, _, _| Ok(container()));
        store.expect_list_objects().returning(|_, _| {
            Ok(ObjectPage {
                names: vec!["../escape.txt".to_string(), "video.mp4".to_string()],
                continuation: None,
            })
        });
        store.expect_download_object()
            .withf(|_, name, _| name == "video.mp4")
            .times(1)
            .returning(|_, _, _| Ok(()));

        let orchestrator = orchestrator(MockJobService::new(), store);
        let err = orchestrator.download_output_asset("output-1", temp.path()).await.unwrap_err();
        assert!(matches!(err, MediaJobError::Storage(message) if message.starts_with("1 of 2")));
    }

    /// Store whose downloads take real time, to observe the join behaviour
    #[derive(Default)]
    struct SlowStore {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        completed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AssetStore for SlowStore {
        async fn get_asset(&self, _name: &str) -> Result<Option<Asset>> {
            unimplemented!()
        }

        async fn create_or_update_asset(&self, _name: &str) -> Result<Asset> {
            unimplemented!()
        }

        async fn delete_asset(&self, _name: &str) -> Result<()> {
            unimplemented!()
        }

        async fn issue_access_grant(
            &self,
            _name: &str,
            _permission: AccessPermission,
            _expiry: chrono::DateTime<Utc>,
        ) -> Result<Url> {
            Ok(container())
        }

        async fn list_objects(&self, _container: &Url, continuation: Option<String>) -> Result<ObjectPage> {
            Ok(match continuation {
                None => ObjectPage {
                    names: (0..3).map(|i| format!("a{}.mp4", i)).collect(),
                    continuation: Some("next".to_string()),
                },
                Some(_) => ObjectPage {
                    names: (0..3).map(|i| format!("b{}.mp4", i)).collect(),
                    continuation: None,
                },
            })
        }

        async fn upload_object(&self, _container: &Url, _object_name: &str, _local_path: &Path) -> Result<()> {
            unimplemented!()
        }

        async fn download_object(&self, _container: &Url, name: &str, _local_path: &Path) -> Result<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let delay = if name.starts_with('a') { 30 } else { 5 };
            sleep(Duration::from_millis(delay)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_download_runs_concurrently_and_joins() {
        let temp = tempfile::tempdir().unwrap();
        let store = SlowStore::default();
        let completed = Arc::clone(&store.completed);

        let orchestrator = JobOrchestrator::new(
            Box::new(MockJobService::new()),
            Box::new(store),
            OrchestratorOptions::default(),
        );
        orchestrator.download_output_asset("output-1", temp.path()).await.unwrap();

        assert_eq!(completed.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_download_concurrency_is_bounded() {
        let temp = tempfile::tempdir().unwrap();
        let store = Arc::new(SlowStore::default());

        struct Shared(Arc<SlowStore>);

        #[async_trait]
        impl AssetStore for Shared {
            async fn get_asset(&self, name: &str) -> Result<Option<Asset>> {
                self.0.get_asset(name).await
            }
            async fn create_or_update_asset(&self, name: &str) -> Result<Asset> {
                self.0.create_or_update_asset(name).await
            }
            async fn delete_asset(&self, name: &str) -> Result<()> {
                self.0.delete_asset(name).await
            }
            async fn issue_access_grant(
                &self,
                name: &str,
                permission: AccessPermission,
                expiry: chrono::DateTime<Utc>,
            ) -> Result<Url> {
                self.0.issue_access_grant(name, permission, expiry).await
            }
            async fn list_objects(&self, container: &Url, continuation: Option<String>) -> Result<ObjectPage> {
                self.0.list_objects(container, continuation).await
            }
            async fn upload_object(&self, container: &Url, name: &str, path: &Path) -> Result<()> {
                self.0.upload_object(container, name, path).await
            }
            async fn download_object(&self, container: &Url, name: &str, path: &Path) -> Result<()> {
                self.0.download_object(container, name, path).await
            }
        }

        let options = OrchestratorOptions {
            download_concurrency: 2,
            ..OrchestratorOptions::default()
        };
        let orchestrator = JobOrchestrator::new(
            Box::new(MockJobService::new()),
            Box::new(Shared(Arc::clone(&store))),
            options,
        );
        orchestrator.download_output_asset("output-1", temp.path()).await.unwrap();

        assert_eq!(store.completed.load(Ordering::SeqCst), 6);
        assert_eq!(store.peak.load(Ordering::SeqCst), 2);
    }

    fn key_policy() -> KeyPolicy {
        KeyPolicy {
            name: "SharedContentKeyPolicyUsedByAllAssets".to_string(),
            issuer: "myIssuer".to_string(),
            audience: "myAudience".to_string(),
            signing_key: vec![7; 40],
        }
    }

    #[tokio::test]
    async fn test_protected_grant_ensures_key_policy_and_starts_endpoint() {
        let mut jobs = MockJobService::new();
        let mut seq = Sequence::new();
        jobs.expect_get_key_policy()
            .with(eq("SharedContentKeyPolicyUsedByAllAssets"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(None));
        jobs.expect_create_or_update_key_policy()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|p| Ok(p.clone()));
        jobs.expect_create_streaming_grant()
            .withf(|grant, asset, policy, key_policy| {
                grant == "locator-1"
                    && asset == "output-1"
                    && *policy == StreamingPolicy::Protected
                    && key_policy.as_deref() == Some("SharedContentKeyPolicyUsedByAllAssets")
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|grant, asset, policy, key_policy| {
                Ok(StreamingGrant {
                    name: grant.to_string(),
                    asset_name: asset.to_string(),
                    policy,
                    key_policy_name: key_policy,
                    content_key_ids: vec!["8f3a1c52-0000-4d52-9c00-5d5e3a4b7f01".to_string()],
                    paths: Vec::new(),
                })
            });
        // Stopped, still starting after the start request, then running
        let mut checks = 0;
        jobs.expect_get_endpoint()
            .with(eq(DEFAULT_STREAMING_ENDPOINT))
            .times(3)
            .returning(move |name| {
                checks += 1;
                Ok(StreamingEndpoint {
                    name: name.to_string(),
                    host_name: "acct-usw22.streaming.media.azure.net".to_string(),
                    running: checks == 3,
                })
            });
        jobs.expect_start_endpoint()
            .with(eq(DEFAULT_STREAMING_ENDPOINT))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        jobs.expect_list_streaming_paths()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(vec![StreamingPath {
                    protocol: StreamingProtocol::Dash,
                    url: "/abc/video.ism/manifest(format=mpd-time-csf,encryption=cbc)".to_string(),
                }])
            });

        let options = OrchestratorOptions {
            endpoint_poll_interval: TICK,
            ..OrchestratorOptions::default()
        };
        let orchestrator = JobOrchestrator::new(Box::new(jobs), Box::new(MockAssetStore::new()), options);
        let policy = key_policy();
        let grant = orchestrator
            .create_streaming_grant("output-1", "locator-1", StreamingPolicy::Protected, Some(&policy))
            .await
            .unwrap();

        assert_eq!(grant.content_key_ids.len(), 1);
        assert_eq!(
            grant.path_for(StreamingProtocol::Dash),
            Some("https://acct-usw22.streaming.media.azure.net/abc/video.ism/manifest(format=mpd-time-csf,encryption=cbc)")
        );
    }

    #[tokio::test]
    async fn test_clear_grant_with_running_endpoint() {
        let mut jobs = MockJobService::new();
        jobs.expect_create_streaming_grant()
            .withf(|_, _, policy, key_policy| *policy == StreamingPolicy::Clear && key_policy.is_none())
            .times(1)
            .returning(|grant, asset, policy, _| {
                Ok(StreamingGrant {
                    name: grant.to_string(),
                    asset_name: asset.to_string(),
                    policy,
                    key_policy_name: None,
                    content_key_ids: Vec::new(),
                    paths: Vec::new(),
                })
            });
        jobs.expect_get_endpoint().returning(|name| {
            Ok(StreamingEndpoint { name: name.to_string(), host_name: "host".to_string(), running: true })
        });
        jobs.expect_list_streaming_paths().returning(|_| Ok(Vec::new()));

        let orchestrator = orchestrator(jobs, MockAssetStore::new());
        let grant = orchestrator
            .create_streaming_grant("output-1", "locator-1", StreamingPolicy::Clear, None)
            .await
            .unwrap();
        assert!(grant.paths.is_empty());
    }

    #[tokio::test]
    async fn test_endpoint_that_never_starts_times_out() {
        let mut jobs = MockJobService::new();
        jobs.expect_create_streaming_grant().returning(|grant, asset, policy, _| {
            Ok(StreamingGrant {
                name: grant.to_string(),
                asset_name: asset.to_string(),
                policy,
                key_policy_name: None,
                content_key_ids: Vec::new(),
                paths: Vec::new(),
            })
        });
        jobs.expect_get_endpoint().returning(|name| {
            Ok(StreamingEndpoint { name: name.to_string(), host_name: "host".to_string(), running: false })
        });
        jobs.expect_start_endpoint().times(1).returning(|_| Ok(()));
        jobs.expect_list_streaming_paths().never();

        let options = OrchestratorOptions {
            timeout: Some(Duration::from_millis(20)),
            endpoint_poll_interval: Duration::from_millis(5),
            ..OrchestratorOptions::default()
        };
        let orchestrator = JobOrchestrator::new(Box::new(jobs), Box::new(MockAssetStore::new()), options);

        let err = orchestrator
            .create_streaming_grant("output-1", "locator-1", StreamingPolicy::Clear, None)
            .await
            .unwrap_err();
        assert!(matches!(err, MediaJobError::TimedOut { resource, .. } if resource == "streaming endpoint default"));
    }

    #[tokio::test]
    async fn test_cleanup_continues_past_failures() {
        let mut jobs = MockJobService::new();
        let mut store = MockAssetStore::new();
        let mut seq = Sequence::new();

        jobs.expect_delete_job()
            .with(eq("encode"), eq("job-1"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        store.expect_delete_asset()
            .with(eq("asset-1"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        store.expect_delete_asset()
            .with(eq("asset-2"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(MediaJobError::remote("Conflict", "asset is locked")));
        store.expect_delete_asset()
            .with(eq("asset-3"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        jobs.expect_delete_key_policy()
            .with(eq("policy"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let orchestrator = orchestrator(jobs, store);
        let assets = vec!["asset-1".to_string(), "asset-2".to_string(), "asset-3".to_string()];
        let err = orchestrator.cleanup("encode", "job-1", &assets, Some("policy")).await.unwrap_err();

        match err {
            MediaJobError::Cleanup { failed } => assert_eq!(failed, vec!["asset asset-2".to_string()]),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cleanup_job_failure_still_deletes_assets() {
        let mut jobs = MockJobService::new();
        let mut store = MockAssetStore::new();
        jobs.expect_delete_job()
            .times(1)
            .returning(|_, _| Err(MediaJobError::remote("InternalServerError", "try later")));
        store.expect_delete_asset().times(1).returning(|_| Ok(()));

        let orchestrator = orchestrator(jobs, store);
        let err = orchestrator
            .cleanup("encode", "job-1", &["output-1".to_string()], None)
            .await
            .unwrap_err();
        assert!(matches!(err, MediaJobError::Cleanup { failed } if failed == vec!["job job-1".to_string()]));
    }

    #[test]
    fn test_local_object_path() {
        let dir = Path::new("/out/output-1");
        assert_eq!(local_object_path(dir, "a/b.mp4").unwrap(), dir.join("a/b.mp4"));
        assert!(local_object_path(dir, "../b.mp4").is_err());
        assert!(local_object_path(dir, "/etc/passwd").is_err());
        assert!(local_object_path(dir, "").is_err());
    }

    #[test]
    fn test_unique_suffix() {
        let a = unique_suffix();
        assert_eq!(a.len(), 32);
        assert_ne!(a, unique_suffix());
    }
}
