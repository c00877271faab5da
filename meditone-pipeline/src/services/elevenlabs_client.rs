//! Voice synthesis client (ElevenLabs text-to-speech)
//!
//! Requests raw 16-bit PCM at the configured rate; the Voice stage wraps it
//! into a WAV container.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use super::{check_status, ServiceError, VoiceSynthesizer};
use crate::config::ElevenLabsConfig;

#[derive(Debug, Serialize)]
struct TextToSpeechRequest<'a> {
    text: &'a str,
    model_id: &'a str,
}

pub struct ElevenLabsClient {
    http_client: reqwest::Client,
    config: ElevenLabsConfig,
}

impl ElevenLabsClient {
    pub fn new(config: ElevenLabsConfig) -> Result<Self, ServiceError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(180))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ServiceError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            config,
        })
    }

    /// `pcm_<rate>` output format name
    pub fn output_format(&self) -> String {
        format!("pcm_{}", self.config.sample_rate)
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/text-to-speech/{}",
            self.config.base_url, self.config.voice_id
        )
    }
}

#[async_trait]
impl VoiceSynthesizer for ElevenLabsClient {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, ServiceError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| ServiceError::NotConfigured("ELEVENLABS_API_KEY".to_string()))?;

        let body = TextToSpeechRequest {
            text,
            model_id: &self.config.model_id,
        };

        tracing::debug!(
            voice_id = %self.config.voice_id,
            chars = text.len(),
            "Requesting voice synthesis"
        );

        let response = self
            .http_client
            .post(self.endpoint())
            .query(&[("output_format", self.output_format())])
            .header("xi-api-key", api_key)
            .json(&body)
            .send()
            .await
            .map_err(ServiceError::from_reqwest)?;

        let bytes = check_status(response)
            .await?
            .bytes()
            .await
            .map_err(ServiceError::from_reqwest)?;

        tracing::info!(bytes = bytes.len(), "Voice synthesis response received");

        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ElevenLabsConfig {
        ElevenLabsConfig {
            api_key: None,
            base_url: "https://api.elevenlabs.io/v1".to_string(),
            voice_id: "voice-123".to_string(),
            model_id: "eleven_multilingual_v2".to_string(),
            sample_rate: 48_000,
        }
    }

    #[test]
    fn test_endpoint_and_format() {
        let client = ElevenLabsClient::new(config()).unwrap();
        assert_eq!(
            client.endpoint(),
            "https://api.elevenlabs.io/v1/text-to-speech/voice-123"
        );
        assert_eq!(client.output_format(), "pcm_48000");
    }

    #[tokio::test]
    async fn test_missing_key_is_not_configured() {
        let client = ElevenLabsClient::new(config()).unwrap();
        let err = client.synthesize("hello").await.unwrap_err();
        assert!(matches!(err, ServiceError::NotConfigured(_)));
        assert!(!err.is_transient());
    }
}
