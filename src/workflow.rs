use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{MediaJobError, Result};
use crate::model::{Job, JobInput, JobState, KeyPolicy, StreamingGrant, StreamingPolicy, TransformOutput};
use crate::orchestrator::{unique_suffix, JobOrchestrator, OrchestratorOptions};
use crate::service::{ArmClient, JobServiceFactory};
use crate::storage::AssetStoreFactory;
use crate::token::TokenIssuer;

/// Source media for a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    /// Local file uploaded into a new input asset
    File(PathBuf),
    /// HTTPS or SAS URL the service ingests directly
    Url(String),
}

#[derive(Debug, Clone)]
pub struct WorkflowOptions {
    pub input: InputSource,
    /// Publish the output for streaming; `None` skips streaming
    pub streaming: Option<StreamingPolicy>,
    /// Download the output asset into `output_folder`
    pub download: bool,
    pub output_folder: PathBuf,
    /// Delete the job and assets once done
    pub cleanup: bool,
}

/// Resource names for one run, sharing a unique suffix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunNames {
    pub job: String,
    pub input_asset: String,
    pub output_asset: String,
    pub locator: String,
}

impl RunNames {
    pub fn new(prefix: &str) -> Self {
        let uniqueness = unique_suffix();
        Self {
            job: format!("{}job-{}", prefix, uniqueness),
            input_asset: format!("{}input-{}", prefix, uniqueness),
            output_asset: format!("{}output-{}", prefix, uniqueness),
            locator: format!("{}locator-{}", prefix, uniqueness),
        }
    }
}

/// What a run produced
#[derive(Debug)]
pub struct WorkflowReport {
    pub job: Job,
    pub input_asset: Option<String>,
    /// Name actually used for the output asset
    pub output_asset: String,
    pub download_dir: Option<PathBuf>,
    pub streaming: Option<StreamingGrant>,
    /// Bearer token for protected playback
    pub token: Option<String>,
}

pub struct Workflow {
    config: Config,
    orchestrator: JobOrchestrator,
}

impl Workflow {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let arm = Arc::new(ArmClient::new(&config.account)?);
        let orchestrator = JobOrchestrator::new(
            JobServiceFactory::create_service(Arc::clone(&arm)),
            AssetStoreFactory::create_store(arm),
            OrchestratorOptions::from(&config.workflow),
        );

        Ok(Self::with_orchestrator(config, orchestrator))
    }

    pub fn with_orchestrator(config: Config, orchestrator: JobOrchestrator) -> Self {
        Self { config, orchestrator }
    }

    pub fn orchestrator(&self) -> &JobOrchestrator {
        &self.orchestrator
    }

    pub fn transform_name(&self) -> &str {
        &self.config.workflow.transform_name
    }

    /// Key policy described by the `[token]` settings
    pub fn key_policy(&self) -> Result<KeyPolicy> {
        let issuer = TokenIssuer::from_config(&self.config.token)?;
        Ok(KeyPolicy {
            name: self.config.token.key_policy_name.clone(),
            issuer: issuer.issuer().to_string(),
            audience: issuer.audience().to_string(),
            signing_key: issuer.signing_key().to_vec(),
        })
    }

    /// Command that removes what an interrupted run may have created
    pub fn cleanup_hint(&self, options: &WorkflowOptions, names: &RunNames) -> String {
        let mut hint = format!("mediajob cleanup --job {}", names.job);
        if let InputSource::File(_) = options.input {
            hint.push_str(&format!(" --asset {}", names.input_asset));
        }
        hint.push_str(&format!(" --asset {}", names.output_asset));
        if options.streaming == Some(StreamingPolicy::Protected) {
            hint.push_str(&format!(" --key-policy {}", self.config.token.key_policy_name));
        }
        hint
    }

    /// Run the whole submit, wait, fetch sequence for one input
    pub async fn run(&self, options: &WorkflowOptions, names: &RunNames) -> Result<WorkflowReport> {
        // Local problems surface before anything is created remotely
        if options.download && !options.output_folder.is_dir() {
            return Err(MediaJobError::FileNotFound(options.output_folder.display().to_string()));
        }
        if let InputSource::File(path) = &options.input {
            if !path.is_file() {
                return Err(MediaJobError::FileNotFound(path.display().to_string()));
            }
        }
        let protection = match options.streaming {
            Some(StreamingPolicy::Protected) => Some((
                self.key_policy()?,
                TokenIssuer::from_config(&self.config.token)?,
            )),
            _ => None,
        };

        let transform_name = self.transform_name();
        let outputs = vec![TransformOutput::new(self.config.workflow.preset.clone())];
        self.orchestrator.get_or_create_transform(transform_name, outputs).await?;

        let (input, input_asset) = match &options.input {
            InputSource::File(path) => {
                let asset = self.orchestrator.create_input_asset(&names.input_asset, path).await?;
                (JobInput::Asset { asset_name: asset.name.clone() }, Some(asset.name))
            }
            InputSource::Url(url) => (JobInput::Http { files: vec![url.clone()] }, None),
        };

        let output_asset = self.orchestrator.create_output_asset(&names.output_asset).await?.name;

        self.orchestrator
            .submit_job(transform_name, &names.job, &input, std::slice::from_ref(&output_asset))
            .await?;

        let job = self
            .orchestrator
            .wait_for_completion(transform_name, &names.job, self.config.workflow.poll_interval())
            .await?;

        let mut report = WorkflowReport {
            job,
            input_asset,
            output_asset,
            download_dir: None,
            streaming: None,
            token: None,
        };

        if report.job.state == JobState::Finished {
            info!("Job finished");

            if options.download {
                let dir = self
                    .orchestrator
                    .download_output_asset(&report.output_asset, &options.output_folder)
                    .await?;
                report.download_dir = Some(dir);
            }

            if let Some(policy) = options.streaming {
                let grant = self
                    .orchestrator
                    .create_streaming_grant(
                        &report.output_asset,
                        &names.locator,
                        policy,
                        protection.as_ref().map(|(key_policy, _)| key_policy),
                    )
                    .await?;

                if let Some((_, issuer)) = &protection {
                    let key_id = grant.content_key_ids.first().ok_or_else(|| {
                        MediaJobError::remote("MissingContentKey", format!("Locator {} has no content key", grant.name))
                    })?;
                    report.token = Some(issuer.generate(key_id)?);
                }

                report.streaming = Some(grant);
            }
        } else {
            warn!("Job ended in state {}", report.job.state);
        }

        if options.cleanup {
            let mut assets: Vec<String> = report.input_asset.iter().cloned().collect();
            assets.push(report.output_asset.clone());
            let key_policy = protection.as_ref().map(|(policy, _)| policy.name.as_str());

            if let Err(e) = self.orchestrator.cleanup(transform_name, &names.job, &assets, key_policy).await {
                warn!("{}", e);
            }
        }

        Ok(report)
    }
}
