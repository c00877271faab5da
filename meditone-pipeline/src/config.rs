//! Configuration resolution for meditone-pipeline
//!
//! Provides two-tier resolution with Environment → TOML priority. Every value
//! has a code default except collaborator credentials; a missing credential
//! surfaces as a `NotConfigured` error when the collaborator is first used.

use crate::audio::MixParams;
use crate::reconciler::ConversionPolling;
use meditone_common::config::TomlConfig;
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_PORT: u16 = 5740;
pub const DEFAULT_WORKERS: usize = 2;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const OPENAI_MODEL: &str = "gpt-5";
const OPENAI_MAX_OUTPUT_TOKENS: u32 = 500;
const ELEVENLABS_BASE_URL: &str = "https://api.elevenlabs.io/v1";
const ELEVENLABS_VOICE_ID: &str = "21m00Tcm4TlvDq8ikWAM";
const ELEVENLABS_MODEL_ID: &str = "eleven_multilingual_v2";
const ELEVENLABS_SAMPLE_RATE: u32 = 48_000;
const SUNO_BASE_URL: &str = "https://api.sunoapi.org/api/v1";
const SUNO_MODEL: &str = "V3_5";
const DRIVE_FOLDER_NAME: &str = "test";

/// Fully resolved service configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub openai: OpenAiConfig,
    pub elevenlabs: ElevenLabsConfig,
    pub suno: SunoConfig,
    pub google_drive: GoogleDriveConfig,
    pub audio: AudioConfig,
    pub mix: MixParams,
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub max_output_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct ElevenLabsConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub voice_id: String,
    pub model_id: String,
    pub sample_rate: u32,
}

#[derive(Debug, Clone)]
pub struct SunoConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub callback_url: Option<String>,
    /// Shared secret expected in the webhook `?token=` query parameter
    pub webhook_token: Option<String>,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct GoogleDriveConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub refresh_token: Option<String>,
    pub folder_id: Option<String>,
    pub folder_name: String,
}

#[derive(Debug, Clone)]
pub struct AudioConfig {
    pub ffmpeg_bin: String,
    pub ffprobe_bin: String,
    pub duration_fallback_secs: Option<f64>,
    pub mix_timeout: Duration,
    pub conversion: ConversionPolling,
}

impl PipelineConfig {
    /// Resolve every section from the environment and the TOML file
    pub fn resolve(toml: &TomlConfig) -> Self {
        let openai = OpenAiConfig {
            api_key: resolve_string("OPENAI_API_KEY", toml.openai.api_key.as_ref()),
            base_url: resolve_string("OPENAI_BASE_URL", toml.openai.base_url.as_ref())
                .unwrap_or_else(|| OPENAI_BASE_URL.to_string()),
            model: toml
                .openai
                .model
                .clone()
                .unwrap_or_else(|| OPENAI_MODEL.to_string()),
            max_output_tokens: toml
                .openai
                .max_output_tokens
                .unwrap_or(OPENAI_MAX_OUTPUT_TOKENS),
        };

        let elevenlabs = ElevenLabsConfig {
            api_key: resolve_string("ELEVENLABS_API_KEY", toml.elevenlabs.api_key.as_ref()),
            base_url: resolve_string("ELEVENLABS_BASE_URL", toml.elevenlabs.base_url.as_ref())
                .unwrap_or_else(|| ELEVENLABS_BASE_URL.to_string()),
            voice_id: resolve_string("ELEVENLABS_VOICE_ID", toml.elevenlabs.voice_id.as_ref())
                .unwrap_or_else(|| ELEVENLABS_VOICE_ID.to_string()),
            model_id: toml
                .elevenlabs
                .model_id
                .clone()
                .unwrap_or_else(|| ELEVENLABS_MODEL_ID.to_string()),
            sample_rate: toml.elevenlabs.sample_rate.unwrap_or(ELEVENLABS_SAMPLE_RATE),
        };

        let suno = SunoConfig {
            api_key: resolve_string("SUNO_API_KEY", toml.suno.api_key.as_ref()),
            base_url: resolve_string("SUNO_BASE_URL", toml.suno.base_url.as_ref())
                .unwrap_or_else(|| SUNO_BASE_URL.to_string()),
            callback_url: resolve_string("SUNO_CALLBACK_URL", toml.suno.callback_url.as_ref()),
            webhook_token: resolve_string("SUNO_WEBHOOK_TOKEN", toml.suno.webhook_token.as_ref()),
            model: toml
                .suno
                .model
                .clone()
                .unwrap_or_else(|| SUNO_MODEL.to_string()),
        };

        let google_drive = GoogleDriveConfig {
            client_id: resolve_string(
                "GOOGLE_DRIVE_CLIENT_ID",
                toml.google_drive.client_id.as_ref(),
            ),
            client_secret: resolve_string(
                "GOOGLE_DRIVE_CLIENT_SECRET",
                toml.google_drive.client_secret.as_ref(),
            ),
            refresh_token: resolve_string(
                "GOOGLE_DRIVE_REFRESH_TOKEN",
                toml.google_drive.refresh_token.as_ref(),
            ),
            folder_id: resolve_string(
                "GOOGLE_DRIVE_FOLDER_ID",
                toml.google_drive.folder_id.as_ref(),
            ),
            folder_name: toml
                .google_drive
                .folder_name
                .clone()
                .unwrap_or_else(|| DRIVE_FOLDER_NAME.to_string()),
        };

        let fallback_toml = toml.audio.duration_fallback_secs.map(|v| v.to_string());
        let duration_fallback_secs =
            resolve_string("AUDIO_DURATION_FALLBACK", fallback_toml.as_ref()).and_then(|raw| {
                match raw.trim().parse::<f64>() {
                    Ok(secs) if secs > 0.0 => Some(secs),
                    _ => {
                        warn!(value = %raw, "Ignoring invalid AUDIO_DURATION_FALLBACK");
                        None
                    }
                }
            });

        let audio = AudioConfig {
            ffmpeg_bin: resolve_string("FFMPEG_BIN", toml.audio.ffmpeg_bin.as_ref())
                .unwrap_or_else(|| "ffmpeg".to_string()),
            ffprobe_bin: resolve_string("FFPROBE_BIN", toml.audio.ffprobe_bin.as_ref())
                .unwrap_or_else(|| "ffprobe".to_string()),
            duration_fallback_secs,
            mix_timeout: Duration::from_secs(toml.audio.mix_timeout_secs.unwrap_or(180)),
            conversion: ConversionPolling::default(),
        };

        let defaults = MixParams::default();
        let mix = MixParams {
            offset_ms: toml.mix.offset_ms.unwrap_or(defaults.offset_ms),
            tail_ms: toml.mix.tail_ms.unwrap_or(defaults.tail_ms),
            voice_volume: toml.mix.voice_volume.unwrap_or(defaults.voice_volume),
            music_volume: toml.mix.music_volume.unwrap_or(defaults.music_volume),
            fade_out: toml.mix.fade_out.unwrap_or(defaults.fade_out),
            fade_ms: toml.mix.fade_ms.unwrap_or(defaults.fade_ms),
            format: toml
                .mix
                .format
                .as_deref()
                .map(crate::audio::OutputFormat::from_name)
                .unwrap_or(defaults.format),
        };

        let config = Self {
            openai,
            elevenlabs,
            suno,
            google_drive,
            audio,
            mix,
        };
        config.log_missing_credentials();
        config
    }

    fn log_missing_credentials(&self) {
        let missing: Vec<&str> = [
            ("OPENAI_API_KEY", self.openai.api_key.is_none()),
            ("ELEVENLABS_API_KEY", self.elevenlabs.api_key.is_none()),
            ("SUNO_API_KEY", self.suno.api_key.is_none()),
            (
                "GOOGLE_DRIVE_REFRESH_TOKEN",
                self.google_drive.refresh_token.is_none(),
            ),
        ]
        .into_iter()
        .filter(|(_, absent)| *absent)
        .map(|(name, _)| name)
        .collect();

        if missing.is_empty() {
            info!("All collaborator credentials configured");
        } else {
            warn!(
                "Collaborator credentials not configured: {}. Affected stages will fail.",
                missing.join(", ")
            );
        }
    }
}

/// Resolve one setting with Environment → TOML priority
///
/// Blank values count as absent. Warns when both sources are present.
pub fn resolve_string(env_var: &str, toml_value: Option<&String>) -> Option<String> {
    let env_value = std::env::var(env_var).ok().filter(|v| is_valid_value(v));
    let toml_value = toml_value.filter(|v| is_valid_value(v));

    match (env_value, toml_value) {
        (Some(env), Some(_)) => {
            warn!(
                "{} found in both environment and TOML. Using environment (higher priority).",
                env_var
            );
            Some(env)
        }
        (Some(env), None) => Some(env),
        (None, Some(toml)) => Some(toml.clone()),
        (None, None) => None,
    }
}

/// Non-empty, non-whitespace
pub fn is_valid_value(value: &str) -> bool {
    !value.trim().is_empty()
}
