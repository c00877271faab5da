//! Music generation client (Suno API)
//!
//! Every response arrives in a `{code, msg, data}` envelope; each endpoint
//! gets its own typed `data` struct with optional fields rather than path
//! lookups into untyped JSON.

use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::num::NonZeroU32;
use std::time::Duration;

use super::{check_status, MusicGenerator, ServiceError};
use crate::config::SunoConfig;
use crate::models::{
    CandidateTrack, ConversionStatus, ExternalMusicState, MusicJobRequest, MusicTaskStatus,
};

/// Requests per second allowed against the music API
const REQUESTS_PER_SECOND: u32 = 2;

const STYLE_PREFIX: &str = "Meditation, Ambient, ";
const NEGATIVE_TAGS: &str = "Heavy Metal, Upbeat Drums";
const GENERATION_WEIGHT: f64 = 0.65;

/// Common response envelope
#[derive(Debug, Clone, Deserialize)]
pub struct SunoEnvelope<T> {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub msg: Option<String>,
    pub data: Option<T>,
}

impl<T> SunoEnvelope<T> {
    /// Unwrap `data`, mapping an envelope error code to a `ServiceError`
    pub fn into_data(self) -> Result<T, ServiceError> {
        let message = self.msg.unwrap_or_default();
        match self.code {
            Some(200) | None => {}
            Some(429) => return Err(ServiceError::RateLimited),
            Some(code) if code >= 500 => {
                return Err(ServiceError::Http {
                    status: code as u16,
                    body: message,
                })
            }
            Some(code) => {
                return Err(ServiceError::Upstream(format!("code {}: {}", code, message)))
            }
        }
        self.data
            .ok_or_else(|| ServiceError::Decode(format!("response has no data: {}", message)))
    }
}

/// `POST /generate` body
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    style: String,
    title: &'a str,
    custom_mode: bool,
    instrumental: bool,
    model: &'a str,
    negative_tags: &'a str,
    style_weight: f64,
    weirdness_constraint: f64,
    audio_weight: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    call_back_url: Option<&'a str>,
}

/// `POST /wav/generate` body
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct WavRequest<'a> {
    task_id: &'a str,
    audio_id: &'a str,
}

/// `data` of `POST /generate` and `POST /wav/generate`
#[derive(Debug, Clone, Deserialize)]
pub struct TaskIdData {
    #[serde(rename = "taskId", default)]
    pub task_id: Option<String>,
}

/// `data` of `GET /generate/record-info`
#[derive(Debug, Clone, Deserialize)]
pub struct RecordInfoData {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub response: Option<RecordInfoResponse>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordInfoResponse {
    #[serde(rename = "sunoData", default)]
    pub suno_data: Option<Vec<SunoTrack>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SunoTrack {
    pub id: String,
    #[serde(rename = "audioUrl", alias = "audio_url", default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
}

impl From<SunoTrack> for CandidateTrack {
    fn from(track: SunoTrack) -> Self {
        CandidateTrack {
            id: track.id,
            audio_url: track.audio_url,
            duration: track.duration,
        }
    }
}

impl RecordInfoData {
    pub fn into_status(self) -> MusicTaskStatus {
        let state = ExternalMusicState::from_upstream(self.status.as_deref().unwrap_or(""));
        let tracks = self
            .response
            .and_then(|r| r.suno_data)
            .unwrap_or_default()
            .into_iter()
            .map(CandidateTrack::from)
            .collect();
        MusicTaskStatus { state, tracks }
    }
}

/// `data` of `GET /wav/record-info`
#[derive(Debug, Clone, Deserialize)]
pub struct WavRecordData {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub response: Option<WavResponse>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WavResponse {
    #[serde(alias = "audioWavUrl", default)]
    pub audio_wav_url: Option<String>,
}

impl WavRecordData {
    pub fn into_status(self) -> ConversionStatus {
        let status = self.status.unwrap_or_default();
        let url = self
            .response
            .and_then(|r| r.audio_wav_url)
            .filter(|u| !u.trim().is_empty());

        match url {
            Some(download_url) if status == "SUCCESS" => ConversionStatus::Ready { download_url },
            _ if ConversionStatus::is_failure_status(&status) => {
                ConversionStatus::Failed { status }
            }
            _ => ConversionStatus::Pending { status },
        }
    }
}

/// Music generation API client
pub struct SunoClient {
    http_client: reqwest::Client,
    config: SunoConfig,
    rate_limiter: RateLimiter<
        governor::state::direct::NotKeyed,
        governor::state::InMemoryState,
        governor::clock::DefaultClock,
    >,
}

impl SunoClient {
    pub fn new(config: SunoConfig) -> Result<Self, ServiceError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| ServiceError::Network(e.to_string()))?;

        let per_second = NonZeroU32::new(REQUESTS_PER_SECOND).unwrap_or(NonZeroU32::MIN);

        Ok(Self {
            http_client,
            config,
            rate_limiter: RateLimiter::direct(Quota::per_second(per_second)),
        })
    }

    fn api_key(&self) -> Result<&str, ServiceError> {
        self.config
            .api_key
            .as_deref()
            .ok_or_else(|| ServiceError::NotConfigured("SUNO_API_KEY".to_string()))
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ServiceError> {
        let api_key = self.api_key()?;
        self.rate_limiter.until_ready().await;

        let response = self
            .http_client
            .get(format!("{}{}", self.config.base_url, path))
            .bearer_auth(api_key)
            .header("Accept", "application/json")
            .query(query)
            .send()
            .await
            .map_err(ServiceError::from_reqwest)?;

        let envelope: SunoEnvelope<T> = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ServiceError::Decode(e.to_string()))?;
        envelope.into_data()
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ServiceError> {
        let api_key = self.api_key()?;
        self.rate_limiter.until_ready().await;

        let response = self
            .http_client
            .post(format!("{}{}", self.config.base_url, path))
            .bearer_auth(api_key)
            .header("Accept", "application/json")
            .json(body)
            .send()
            .await
            .map_err(ServiceError::from_reqwest)?;

        let envelope: SunoEnvelope<T> = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ServiceError::Decode(e.to_string()))?;
        envelope.into_data()
    }
}

#[async_trait]
impl MusicGenerator for SunoClient {
    async fn start_job(&self, request: &MusicJobRequest) -> Result<String, ServiceError> {
        let body = GenerateRequest {
            style: format!("{}{}", STYLE_PREFIX, request.style),
            title: &request.title,
            custom_mode: true,
            instrumental: true,
            model: &self.config.model,
            negative_tags: NEGATIVE_TAGS,
            style_weight: GENERATION_WEIGHT,
            weirdness_constraint: GENERATION_WEIGHT,
            audio_weight: GENERATION_WEIGHT,
            call_back_url: self.config.callback_url.as_deref(),
        };

        let data: TaskIdData = self.post("/generate", &body).await?;
        let task_id = data
            .task_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| ServiceError::Decode("music job taskId not returned".to_string()))?;

        tracing::info!(external_task_id = %task_id, "Music generation job started");
        Ok(task_id)
    }

    async fn poll_status(&self, external_task_id: &str) -> Result<MusicTaskStatus, ServiceError> {
        let data: RecordInfoData = self
            .get("/generate/record-info", &[("taskId", external_task_id)])
            .await?;
        tracing::debug!(
            external_task_id,
            status = data.status.as_deref().unwrap_or(""),
            "Music task status polled"
        );
        Ok(data.into_status())
    }

    async fn request_lossless_conversion(
        &self,
        external_task_id: &str,
        track_id: &str,
    ) -> Result<String, ServiceError> {
        let body = WavRequest {
            task_id: external_task_id,
            audio_id: track_id,
        };
        let data: TaskIdData = self.post("/wav/generate", &body).await?;
        data.task_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| ServiceError::Decode("WAV conversion taskId not returned".to_string()))
    }

    async fn poll_conversion_status(
        &self,
        conversion_task_id: &str,
    ) -> Result<ConversionStatus, ServiceError> {
        let data: WavRecordData = self
            .get("/wav/record-info", &[("taskId", conversion_task_id)])
            .await?;
        Ok(data.into_status())
    }
}
