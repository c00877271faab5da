//! Plain HTTP download of artifacts referenced by URL

use async_trait::async_trait;
use std::time::Duration;

use super::{check_status, ArtifactFetcher, ServiceError};

pub struct HttpFetcher {
    http_client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, ServiceError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ServiceError::Network(e.to_string()))?;
        Ok(Self { http_client })
    }
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, ServiceError> {
        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(ServiceError::from_reqwest)?;

        let bytes = check_status(response)
            .await?
            .bytes()
            .await
            .map_err(ServiceError::from_reqwest)?;

        tracing::debug!(url, bytes = bytes.len(), "Artifact downloaded");
        Ok(bytes.to_vec())
    }
}
