//! External collaborator contracts and their HTTP clients
//!
//! Stage handlers only see the traits defined here. Concrete clients are
//! constructed once in `main` and injected; tests substitute fakes.

pub mod drive_client;
pub mod elevenlabs_client;
pub mod http_fetcher;
pub mod openai_client;
pub mod suno_client;

pub use drive_client::GoogleDriveClient;
pub use elevenlabs_client::ElevenLabsClient;
pub use http_fetcher::HttpFetcher;
pub use openai_client::OpenAiClient;
pub use suno_client::SunoClient;

use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

use crate::models::{ConversionStatus, MusicJobRequest, MusicTaskStatus};

/// Collaborator failure
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Rate limited by upstream")]
    RateLimited,

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Unexpected response: {0}")]
    Decode(String),

    /// Text generation stopped at its length limit
    #[error("Response truncated at length limit")]
    Truncated { partial: String },

    /// Upstream explicitly reported failure
    #[error("Upstream failure: {0}")]
    Upstream(String),

    #[error("Not configured: {0}")]
    NotConfigured(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    /// Network faults, timeouts, 429 and 5xx are worth retrying
    pub fn is_transient(&self) -> bool {
        match self {
            ServiceError::Network(_)
            | ServiceError::Timeout(_)
            | ServiceError::RateLimited
            | ServiceError::Io(_) => true,
            ServiceError::Http { status, .. } => *status == 429 || *status >= 500,
            ServiceError::Decode(_)
            | ServiceError::Truncated { .. }
            | ServiceError::Upstream(_)
            | ServiceError::NotConfigured(_) => false,
        }
    }

    /// Classify a transport-level reqwest failure
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ServiceError::Timeout(err.to_string())
        } else if err.is_decode() {
            ServiceError::Decode(err.to_string())
        } else {
            ServiceError::Network(err.to_string())
        }
    }
}

/// Turn a non-success HTTP response into a `ServiceError`
pub(crate) async fn check_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status.as_u16() == 429 {
        return Err(ServiceError::RateLimited);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ServiceError::Http {
        status: status.as_u16(),
        body,
    })
}

/// Text generation collaborator
#[async_trait]
pub trait ScriptWriter: Send + Sync {
    /// Generate text for a prompt; `Truncated` signals the length limit
    async fn generate(&self, prompt: &str) -> Result<String, ServiceError>;
}

/// Voice synthesis collaborator
#[async_trait]
pub trait VoiceSynthesizer: Send + Sync {
    /// Raw audio as returned upstream; may be headerless PCM
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, ServiceError>;
}

/// Music generation collaborator
#[async_trait]
pub trait MusicGenerator: Send + Sync {
    /// Start an asynchronous job, returning the external task id
    async fn start_job(&self, request: &MusicJobRequest) -> Result<String, ServiceError>;

    async fn poll_status(&self, external_task_id: &str) -> Result<MusicTaskStatus, ServiceError>;

    /// Start a lossless conversion of one track, returning the conversion task id
    async fn request_lossless_conversion(
        &self,
        external_task_id: &str,
        track_id: &str,
    ) -> Result<String, ServiceError>;

    async fn poll_conversion_status(
        &self,
        conversion_task_id: &str,
    ) -> Result<ConversionStatus, ServiceError>;
}

/// Long-term object storage collaborator
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Upload a local file and return its public URL
    async fn upload(
        &self,
        local_path: &Path,
        name: &str,
        mime_type: &str,
    ) -> Result<String, ServiceError>;
}

/// Downloads artifacts referenced by URL
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, ServiceError>;
}
