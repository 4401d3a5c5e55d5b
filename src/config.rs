use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::error::{MediaJobError, Result};
use crate::model::{Preset, StreamingPolicy};

fn default_api_version() -> String {
    "2021-06-01".to_string()
}

fn default_download_concurrency() -> usize {
    8
}

fn default_key_policy_name() -> String {
    "SharedContentKeyPolicyUsedByAllAssets".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub account: AccountConfig,
    pub workflow: WorkflowConfig,
    pub token: TokenConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Azure subscription that owns the media services account
    pub subscription_id: String,
    /// Resource group of the media services account
    pub resource_group: String,
    /// Media services account name
    pub account_name: String,
    /// Azure AD tenant used for client-credential authentication
    pub tenant_id: String,
    /// Service principal application id
    pub client_id: String,
    /// Service principal secret
    pub client_secret: String,
    /// Resource manager endpoint
    pub arm_endpoint: String,
    /// Azure AD login endpoint
    pub aad_endpoint: String,
    /// Audience requested for management tokens
    pub arm_audience: String,
    /// Management API version
    #[serde(default = "default_api_version")]
    pub api_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Transform reused across runs
    pub transform_name: String,
    /// Seconds between job status polls
    pub poll_interval_secs: u64,
    /// Give up polling after this many seconds (unbounded when unset)
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Consecutive transport failures tolerated while polling
    #[serde(default)]
    pub transient_poll_retries: u32,
    /// Validity window of container access grants
    pub grant_validity_hours: i64,
    /// Maximum parallel object downloads
    #[serde(default = "default_download_concurrency")]
    pub download_concurrency: usize,
    /// Folder downloaded outputs are written to
    pub output_folder: PathBuf,
    /// Streaming locator policy for published outputs
    pub streaming_policy: StreamingPolicy,
    /// Encoder or analyzer used when the transform has to be created
    pub preset: Preset,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    pub issuer: String,
    pub audience: String,
    /// Base64 encoded symmetric key shared with key delivery
    #[serde(default)]
    pub symmetric_key: Option<String>,
    #[serde(default = "default_key_policy_name")]
    pub key_policy_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            account: AccountConfig {
                subscription_id: String::new(),
                resource_group: String::new(),
                account_name: String::new(),
                tenant_id: String::new(),
                client_id: String::new(),
                client_secret: String::new(),
                arm_endpoint: "https://management.azure.com".to_string(),
                aad_endpoint: "https://login.microsoftonline.com".to_string(),
                arm_audience: "https://management.azure.com".to_string(),
                api_version: default_api_version(),
            },
            workflow: WorkflowConfig {
                transform_name: "MyTransformWithAdaptiveStreamingPreset".to_string(),
                poll_interval_secs: 20,
                timeout_secs: None,
                transient_poll_retries: 0,
                grant_validity_hours: 1,
                download_concurrency: default_download_concurrency(),
                output_folder: PathBuf::from("Output"),
                streaming_policy: StreamingPolicy::Clear,
                preset: Preset::BuiltInEncoder {
                    preset_name: "AdaptiveStreaming".to_string(),
                },
            },
            token: TokenConfig {
                issuer: "myIssuer".to_string(),
                audience: "myAudience".to_string(),
                symmetric_key: None,
                key_policy_name: default_key_policy_name(),
            },
        }
    }
}

impl WorkflowConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn grant_validity(&self) -> chrono::Duration {
        chrono::Duration::hours(self.grant_validity_hours)
    }
}

impl TokenConfig {
    /// Decode the configured signing key
    pub fn signing_key(&self) -> Result<Vec<u8>> {
        use base64::Engine;

        let encoded = self.symmetric_key.as_deref()
            .ok_or_else(|| MediaJobError::Config("token.symmetric_key is not set".to_string()))?;

        base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| MediaJobError::Config(format!("token.symmetric_key is not valid base64: {}", e)))
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| MediaJobError::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| MediaJobError::Config(format!("Failed to parse config file: {}", e)))
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| MediaJobError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| MediaJobError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Override settings from process environment variables
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let account = &mut self.account;
        let fields: [(&str, &mut String); 9] = [
            ("AZURE_SUBSCRIPTION_ID", &mut account.subscription_id),
            ("AZURE_RESOURCE_GROUP", &mut account.resource_group),
            ("AZURE_MEDIA_SERVICES_ACCOUNT_NAME", &mut account.account_name),
            ("AZURE_TENANT_ID", &mut account.tenant_id),
            ("AZURE_CLIENT_ID", &mut account.client_id),
            ("AZURE_CLIENT_SECRET", &mut account.client_secret),
            ("AZURE_ARM_ENDPOINT", &mut account.arm_endpoint),
            ("AZURE_AAD_ENDPOINT", &mut account.aad_endpoint),
            ("AZURE_ARM_TOKEN_AUDIENCE", &mut account.arm_audience),
        ];

        for (key, field) in fields {
            if let Some(value) = lookup(key).filter(|v| !v.is_empty()) {
                *field = value;
            }
        }

        if let Some(key) = lookup("SYMMETRIC_KEY").filter(|v| !v.is_empty()) {
            self.token.symmetric_key = Some(key);
        }
    }

    /// Check that everything needed to reach the service is present
    pub fn validate(&self) -> Result<()> {
        let account = &self.account;
        let required = [
            ("subscription_id", &account.subscription_id),
            ("resource_group", &account.resource_group),
            ("account_name", &account.account_name),
            ("tenant_id", &account.tenant_id),
            ("client_id", &account.client_id),
            ("client_secret", &account.client_secret),
        ];

        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| *name)
            .collect();

        if !missing.is_empty() {
            return Err(MediaJobError::Config(format!(
                "Missing account settings: {}. Fill in the config file or set the AZURE_* environment variables",
                missing.join(", ")
            )));
        }

        if self.workflow.poll_interval_secs == 0 {
            return Err(MediaJobError::Config("workflow.poll_interval_secs must be positive".to_string()));
        }

        if self.workflow.download_concurrency == 0 {
            return Err(MediaJobError::Config("workflow.download_concurrency must be positive".to_string()));
        }

        if self.workflow.grant_validity_hours < 1 {
            return Err(MediaJobError::Config("workflow.grant_validity_hours must be at least 1".to_string()));
        }

        if let Preset::Other { odata_type } = &self.workflow.preset {
            return Err(MediaJobError::Config(format!("workflow.preset kind {} cannot be created", odata_type)));
        }

        Ok(())
    }
}
