use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

use super::{ArmClient, JobService};
use crate::error::{MediaJobError, Result};
use crate::model::{
    Job, JobInput, JobOutput, KeyPolicy, OnErrorPolicy, Preset, Priority, StreamingEndpoint,
    StreamingGrant, StreamingPath, StreamingPolicy, StreamingProtocol, TransformDefinition,
    TransformOutput,
};
use crate::token::CONTENT_KEY_IDENTIFIER_CLAIM;

const ODATA_TYPE: &str = "@odata.type";

#[derive(Debug, Deserialize)]
struct Resource<P> {
    name: String,
    properties: P,
}

#[derive(Debug, Deserialize)]
struct TransformProperties {
    #[serde(default)]
    outputs: Vec<TransformOutputWire>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransformOutputWire {
    #[serde(default)]
    on_error: Option<String>,
    #[serde(default)]
    relative_priority: Option<String>,
    preset: Value,
}

#[derive(Debug, Deserialize)]
struct JobProperties {
    state: String,
    #[serde(default)]
    input: Option<Value>,
    #[serde(default)]
    outputs: Vec<JobOutputWire>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobOutputWire {
    #[serde(default)]
    asset_name: Option<String>,
    state: String,
    #[serde(default)]
    progress: Option<i64>,
    #[serde(default)]
    error: Option<JobErrorWire>,
}

#[derive(Debug, Deserialize)]
struct JobErrorWire {
    code: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct JobList {
    value: Vec<Resource<JobProperties>>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KeyPolicyProperties {
    #[serde(default)]
    options: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocatorProperties {
    asset_name: String,
    #[serde(default)]
    default_content_key_policy_name: Option<String>,
    #[serde(default)]
    content_keys: Vec<ContentKeyWire>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentKeyList {
    #[serde(default)]
    content_keys: Vec<ContentKeyWire>,
}

#[derive(Debug, Deserialize)]
struct ContentKeyWire {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PathList {
    #[serde(default)]
    streaming_paths: Vec<StreamingPathWire>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamingPathWire {
    streaming_protocol: String,
    #[serde(default)]
    paths: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EndpointProperties {
    host_name: String,
    #[serde(default)]
    resource_state: Option<String>,
}

/// Job service backed by the media services REST API
pub struct ArmJobService {
    arm: Arc<ArmClient>,
}

impl ArmJobService {
    pub fn new(arm: Arc<ArmClient>) -> Self {
        Self { arm }
    }
}

#[async_trait]
impl JobService for ArmJobService {
    async fn get_transform(&self, name: &str) -> Result<Option<TransformDefinition>> {
        let resource: Option<Resource<TransformProperties>> =
            self.arm.get(&format!("transforms/{}", name)).await?;

        Ok(resource.map(transform_from_wire))
    }

    async fn create_or_update_transform(&self, transform: &TransformDefinition) -> Result<TransformDefinition> {
        info!("Creating transform {}", transform.name);
        let body = transform_body(transform)?;
        let resource: Resource<TransformProperties> = self
            .arm
            .put(&format!("transforms/{}", transform.name), &body)
            .await?;

        Ok(transform_from_wire(resource))
    }

    async fn create_job(
        &self,
        transform_name: &str,
        job_name: &str,
        input: &JobInput,
        output_asset_names: &[String],
    ) -> Result<Job> {
        let body = job_body(input, output_asset_names);
        let resource: Resource<JobProperties> = self
            .arm
            .put(&format!("transforms/{}/jobs/{}", transform_name, job_name), &body)
            .await?;

        job_from_wire(resource)
    }

    async fn get_job(&self, transform_name: &str, job_name: &str) -> Result<Job> {
        let resource: Resource<JobProperties> = self
            .arm
            .get_required(&format!("transforms/{}/jobs/{}", transform_name, job_name))
            .await?;

        job_from_wire(resource)
    }

    async fn cancel_job(&self, transform_name: &str, job_name: &str) -> Result<()> {
        self.arm
            .post_action(&format!("transforms/{}/jobs/{}/cancelJob", transform_name, job_name))
            .await
    }

    async fn delete_job(&self, transform_name: &str, job_name: &str) -> Result<()> {
        self.arm
            .delete(&format!("transforms/{}/jobs/{}", transform_name, job_name))
            .await
    }

    async fn list_jobs(&self, transform_name: &str) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        let mut page: Option<JobList> = self.arm.get(&format!("transforms/{}/jobs", transform_name)).await?;

        while let Some(list) = page.take() {
            for resource in list.value {
                jobs.push(job_from_wire(resource)?);
            }

            if let Some(next) = list.next_link.filter(|link| !link.is_empty()) {
                debug!("Following job list continuation");
                page = self.arm.get_url(&next).await?;
            }
        }

        Ok(jobs)
    }

    async fn get_key_policy(&self, name: &str) -> Result<Option<KeyPolicy>> {
        let resource: Option<Resource<KeyPolicyProperties>> =
            self.arm.get(&format!("contentKeyPolicies/{}", name)).await?;

        Ok(resource.map(key_policy_from_wire))
    }

    async fn create_or_update_key_policy(&self, policy: &KeyPolicy) -> Result<KeyPolicy> {
        info!("Creating content key policy {}", policy.name);
        let body = key_policy_body(policy);
        let _: Resource<KeyPolicyProperties> = self
            .arm
            .put(&format!("contentKeyPolicies/{}", policy.name), &body)
            .await?;

        Ok(policy.clone())
    }

    async fn delete_key_policy(&self, name: &str) -> Result<()> {
        self.arm.delete(&format!("contentKeyPolicies/{}", name)).await
    }

    async fn create_streaming_grant(
        &self,
        grant_name: &str,
        asset_name: &str,
        policy: StreamingPolicy,
        key_policy_name: Option<String>,
    ) -> Result<StreamingGrant> {
        let mut properties = json!({
            "assetName": asset_name,
            "streamingPolicyName": policy.predefined_name(),
        });
        if let Some(key_policy) = &key_policy_name {
            properties["defaultContentKeyPolicyName"] = json!(key_policy);
        }

        let resource: Resource<LocatorProperties> = self
            .arm
            .put(&format!("streamingLocators/{}", grant_name), &json!({ "properties": properties }))
            .await?;

        let mut content_key_ids: Vec<String> =
            resource.properties.content_keys.into_iter().map(|k| k.id).collect();

        if content_key_ids.is_empty() && policy == StreamingPolicy::Protected {
            let keys: ContentKeyList = self
                .arm
                .post(&format!("streamingLocators/{}/listContentKeys", grant_name), &json!({}))
                .await?;
            content_key_ids = keys.content_keys.into_iter().map(|k| k.id).collect();
        }

        Ok(StreamingGrant {
            name: resource.name,
            asset_name: resource.properties.asset_name,
            policy,
            key_policy_name: resource.properties.default_content_key_policy_name.or(key_policy_name),
            content_key_ids,
            paths: Vec::new(),
        })
    }

    async fn list_streaming_paths(&self, grant_name: &str) -> Result<Vec<StreamingPath>> {
        let list: PathList = self
            .arm
            .post(&format!("streamingLocators/{}/listPaths", grant_name), &json!({}))
            .await?;

        Ok(paths_from_wire(list))
    }

    async fn get_endpoint(&self, name: &str) -> Result<StreamingEndpoint> {
        let resource: Resource<EndpointProperties> = self
            .arm
            .get_required(&format!("streamingEndpoints/{}", name))
            .await?;

        Ok(StreamingEndpoint {
            name: resource.name,
            host_name: resource.properties.host_name,
            running: resource.properties.resource_state.as_deref() == Some("Running"),
        })
    }

    async fn start_endpoint(&self, name: &str) -> Result<()> {
        info!("Starting streaming endpoint {}", name);
        self.arm
            .post_action(&format!("streamingEndpoints/{}/start", name))
            .await
    }
}

fn transform_body(transform: &TransformDefinition) -> Result<Value> {
    let outputs = transform
        .outputs
        .iter()
        .map(|output| {
            Ok(json!({
                "onError": match output.on_error {
                    OnErrorPolicy::StopProcessingJob => "StopProcessingJob",
                    OnErrorPolicy::ContinueJob => "ContinueJob",
                },
                "relativePriority": match output.relative_priority {
                    Priority::Low => "Low",
                    Priority::Normal => "Normal",
                    Priority::High => "High",
                },
                "preset": preset_body(&output.preset)?,
            }))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(json!({ "properties": { "outputs": outputs } }))
}

fn preset_body(preset: &Preset) -> Result<Value> {
    match preset {
        Preset::BuiltInEncoder { preset_name } => Ok(json!({
            ODATA_TYPE: "#Microsoft.Media.BuiltInStandardEncoderPreset",
            "presetName": preset_name,
        })),
        Preset::VideoAnalyzer { audio_language } => Ok(json!({
            ODATA_TYPE: "#Microsoft.Media.VideoAnalyzerPreset",
            "audioLanguage": audio_language,
        })),
        Preset::AudioAnalyzer { audio_language } => Ok(json!({
            ODATA_TYPE: "#Microsoft.Media.AudioAnalyzerPreset",
            "audioLanguage": audio_language,
        })),
        Preset::Other { odata_type } => Err(MediaJobError::Config(format!(
            "Cannot create a transform with unsupported preset type {}",
            odata_type
        ))),
    }
}

fn preset_from_wire(value: &Value) -> Preset {
    let odata_type = value[ODATA_TYPE].as_str().unwrap_or_default();
    let field = |name: &str| value[name].as_str().unwrap_or_default().to_string();

    match odata_type {
        "#Microsoft.Media.BuiltInStandardEncoderPreset" => Preset::BuiltInEncoder { preset_name: field("presetName") },
        "#Microsoft.Media.VideoAnalyzerPreset" => Preset::VideoAnalyzer { audio_language: field("audioLanguage") },
        "#Microsoft.Media.AudioAnalyzerPreset" => Preset::AudioAnalyzer { audio_language: field("audioLanguage") },
        other => Preset::Other { odata_type: other.to_string() },
    }
}

fn transform_from_wire(resource: Resource<TransformProperties>) -> TransformDefinition {
    let outputs = resource
        .properties
        .outputs
        .iter()
        .map(|output| TransformOutput {
            preset: preset_from_wire(&output.preset),
            on_error: match output.on_error.as_deref() {
                Some("ContinueJob") => OnErrorPolicy::ContinueJob,
                _ => OnErrorPolicy::StopProcessingJob,
            },
            relative_priority: match output.relative_priority.as_deref() {
                Some("Low") => Priority::Low,
                Some("High") => Priority::High,
                _ => Priority::Normal,
            },
        })
        .collect();

    TransformDefinition {
        name: resource.name,
        outputs,
    }
}

fn job_body(input: &JobInput, output_asset_names: &[String]) -> Value {
    let input = match input {
        JobInput::Asset { asset_name } => json!({
            ODATA_TYPE: "#Microsoft.Media.JobInputAsset",
            "assetName": asset_name,
        }),
        JobInput::Http { files } => json!({
            ODATA_TYPE: "#Microsoft.Media.JobInputHttp",
            "files": files,
        }),
    };

    let outputs: Vec<Value> = output_asset_names
        .iter()
        .map(|name| json!({
            ODATA_TYPE: "#Microsoft.Media.JobOutputAsset",
            "assetName": name,
        }))
        .collect();

    json!({ "properties": { "input": input, "outputs": outputs } })
}

fn job_input_from_wire(value: &Value) -> Option<JobInput> {
    match value[ODATA_TYPE].as_str()? {
        "#Microsoft.Media.JobInputAsset" => Some(JobInput::Asset {
            asset_name: value["assetName"].as_str()?.to_string(),
        }),
        "#Microsoft.Media.JobInputHttp" => Some(JobInput::Http {
            files: value["files"]
                .as_array()
                .map(|files| files.iter().filter_map(|f| f.as_str().map(str::to_string)).collect())
                .unwrap_or_default(),
        }),
        _ => None,
    }
}

fn job_from_wire(resource: Resource<JobProperties>) -> Result<Job> {
    let outputs = resource
        .properties
        .outputs
        .into_iter()
        .map(|output| {
            Ok(JobOutput {
                asset_name: output.asset_name.unwrap_or_default(),
                state: output.state.parse()?,
                progress: output.progress.map(|p| p.clamp(0, 100) as u8),
                error: output.error.map(|e| format!("{}: {}", e.code, e.message)),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Job {
        name: resource.name,
        state: resource.properties.state.parse()?,
        input: resource.properties.input.as_ref().and_then(job_input_from_wire),
        outputs,
    })
}

fn key_policy_body(policy: &KeyPolicy) -> Value {
    let key = base64::engine::general_purpose::STANDARD.encode(&policy.signing_key);

    json!({
        "properties": {
            "options": [{
                "configuration": {
                    ODATA_TYPE: "#Microsoft.Media.ContentKeyPolicyClearKeyConfiguration",
                },
                "restriction": {
                    ODATA_TYPE: "#Microsoft.Media.ContentKeyPolicyTokenRestriction",
                    "issuer": policy.issuer,
                    "audience": policy.audience,
                    "primaryVerificationKey": {
                        ODATA_TYPE: "#Microsoft.Media.ContentKeyPolicySymmetricTokenKey",
                        "keyValue": key,
                    },
                    "restrictionTokenType": "Jwt",
                    "requiredClaims": [{ "claimType": CONTENT_KEY_IDENTIFIER_CLAIM }],
                },
            }],
        },
    })
}

/// The service never echoes key material, so the returned policy has an empty signing key
fn key_policy_from_wire(resource: Resource<KeyPolicyProperties>) -> KeyPolicy {
    let restriction = resource
        .properties
        .options
        .first()
        .map(|option| option["restriction"].clone())
        .unwrap_or(Value::Null);
    let field = |name: &str| restriction[name].as_str().unwrap_or_default().to_string();

    KeyPolicy {
        name: resource.name,
        issuer: field("issuer"),
        audience: field("audience"),
        signing_key: Vec::new(),
    }
}

fn paths_from_wire(list: PathList) -> Vec<StreamingPath> {
    list.streaming_paths
        .into_iter()
        .filter_map(|entry| {
            let protocol = match entry.streaming_protocol.as_str() {
                "Hls" => StreamingProtocol::Hls,
                "Dash" => StreamingProtocol::Dash,
                "SmoothStreaming" => StreamingProtocol::SmoothStreaming,
                _ => return None,
            };
            Some(entry.paths.into_iter().map(move |url| StreamingPath { protocol, url }))
        })
        .flatten()
        .collect()
}
