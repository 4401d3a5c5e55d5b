use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediaJobError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API call failed with error code '{code}' and message '{message}'")]
    RemoteService { code: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    #[error("Timed out after {waited:?} waiting for {resource}")]
    TimedOut { resource: String, waited: Duration },

    #[error("Cleanup failed for: {}", failed.join(", "))]
    Cleanup { failed: Vec<String> },
}

impl MediaJobError {
    pub fn remote(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RemoteService {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Transport-level failures that may succeed when repeated.
    pub fn is_transient(&self) -> bool {
        match self {
            MediaJobError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, MediaJobError>;
