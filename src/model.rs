//! Domain types shared by the orchestrator and the remote collaborators.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{MediaJobError, Result};

/// What to do with the rest of a job when one transform output fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnErrorPolicy {
    StopProcessingJob,
    ContinueJob,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Low,
    Normal,
    High,
}

/// Processing recipe applied by a transform output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Preset {
    /// One of the service's built-in encoder presets, e.g. `AdaptiveStreaming`
    #[serde(rename = "builtin")]
    BuiltInEncoder { preset_name: String },
    VideoAnalyzer { audio_language: String },
    AudioAnalyzer { audio_language: String },
    /// A preset type this tool does not model; only ever read back from the service
    Other { odata_type: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformOutput {
    pub preset: Preset,
    pub on_error: OnErrorPolicy,
    pub relative_priority: Priority,
}

impl TransformOutput {
    pub fn new(preset: Preset) -> Self {
        Self {
            preset,
            on_error: OnErrorPolicy::StopProcessingJob,
            relative_priority: Priority::Normal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformDefinition {
    pub name: String,
    pub outputs: Vec<TransformOutput>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub name: String,
    /// Backing storage container, once the service has assigned one
    pub container: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessPermission {
    Read,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Queued,
    Scheduled,
    Processing,
    Canceling,
    Finished,
    Error,
    Canceled,
}

impl JobState {
    /// Finished, Error and Canceled are absorbing
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Finished | JobState::Error | JobState::Canceled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Queued => "Queued",
            JobState::Scheduled => "Scheduled",
            JobState::Processing => "Processing",
            JobState::Canceling => "Canceling",
            JobState::Finished => "Finished",
            JobState::Error => "Error",
            JobState::Canceled => "Canceled",
        };
        f.write_str(name)
    }
}

impl FromStr for JobState {
    type Err = MediaJobError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Queued" => Ok(JobState::Queued),
            "Scheduled" => Ok(JobState::Scheduled),
            "Processing" => Ok(JobState::Processing),
            "Canceling" => Ok(JobState::Canceling),
            "Finished" => Ok(JobState::Finished),
            "Error" => Ok(JobState::Error),
            "Canceled" => Ok(JobState::Canceled),
            other => Err(MediaJobError::remote("UnknownJobState", format!("unrecognised job state '{}'", other))),
        }
    }
}

/// Where a job reads its source media from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobInput {
    Asset { asset_name: String },
    Http { files: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutput {
    pub asset_name: String,
    pub state: JobState,
    /// Percent complete, reported while processing
    pub progress: Option<u8>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub name: String,
    pub state: JobState,
    pub input: Option<JobInput>,
    pub outputs: Vec<JobOutput>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamingPolicy {
    /// Unencrypted streaming
    Clear,
    /// AES-128 clear-key encryption with token-restricted key delivery
    Protected,
}

impl StreamingPolicy {
    pub fn predefined_name(self) -> &'static str {
        match self {
            StreamingPolicy::Clear => "Predefined_ClearStreamingOnly",
            StreamingPolicy::Protected => "Predefined_ClearKey",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingProtocol {
    Hls,
    Dash,
    SmoothStreaming,
}

impl fmt::Display for StreamingProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamingProtocol::Hls => "HLS",
            StreamingProtocol::Dash => "DASH",
            StreamingProtocol::SmoothStreaming => "Smooth Streaming",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingPath {
    pub protocol: StreamingProtocol,
    /// Path relative to the endpoint host until resolved, then a full URL
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingGrant {
    pub name: String,
    pub asset_name: String,
    pub policy: StreamingPolicy,
    pub key_policy_name: Option<String>,
    /// Identifiers of content keys generated for the grant
    pub content_key_ids: Vec<String>,
    pub paths: Vec<StreamingPath>,
}

impl StreamingGrant {
    pub fn path_for(&self, protocol: StreamingProtocol) -> Option<&str> {
        self.paths
            .iter()
            .find(|p| p.protocol == protocol)
            .map(|p| p.url.as_str())
    }
}

/// Token-restricted key delivery configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPolicy {
    pub name: String,
    pub issuer: String,
    pub audience: String,
    pub signing_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingEndpoint {
    pub name: String,
    pub host_name: String,
    pub running: bool,
}

/// One page of a container listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectPage {
    pub names: Vec<String>,
    /// Present while more pages remain
    pub continuation: Option<String>,
}
