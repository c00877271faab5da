//! Voice/music mixer
//!
//! Inputs are materialized into a private scratch directory that is removed
//! when the mix returns, on success and failure alike.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::graph::{build_filter_graph, target_seconds};
use super::toolkit::{MediaToolkit, MixInvocation};
use super::wav::{detect_container, AudioContainer};
use super::{MixError, MixParams, OutputFormat};

/// Result of a successful mix
#[derive(Debug, Clone)]
pub struct MixedAudio {
    pub bytes: Vec<u8>,
    pub format: OutputFormat,
    pub mime_type: &'static str,
    /// offset + voice duration + tail
    pub total_seconds: f64,
}

pub struct AudioMixer {
    toolkit: Arc<dyn MediaToolkit>,
    scratch_dir: PathBuf,
    duration_fallback_secs: Option<f64>,
}

impl AudioMixer {
    pub fn new(
        toolkit: Arc<dyn MediaToolkit>,
        scratch_dir: impl Into<PathBuf>,
        duration_fallback_secs: Option<f64>,
    ) -> Self {
        Self {
            toolkit,
            scratch_dir: scratch_dir.into(),
            duration_fallback_secs: duration_fallback_secs.filter(|secs| *secs > 0.0),
        }
    }

    pub async fn mix(
        &self,
        voice: &[u8],
        music: &[u8],
        params: &MixParams,
    ) -> Result<MixedAudio, MixError> {
        if voice.is_empty() {
            return Err(MixError::EmptyVoice);
        }
        if music.is_empty() {
            return Err(MixError::EmptyMusic);
        }

        tokio::fs::create_dir_all(&self.scratch_dir).await?;
        let workdir = tempfile::Builder::new()
            .prefix("mix_")
            .tempdir_in(&self.scratch_dir)?;

        let voice_path = workdir
            .path()
            .join(format!("voice.{}", detect_container(voice).extension()));
        let music_ext = match detect_container(music) {
            AudioContainer::RawPcm => "mp3",
            other => other.extension(),
        };
        let music_path = workdir.path().join(format!("music.{}", music_ext));
        tokio::fs::write(&voice_path, voice).await?;
        tokio::fs::write(&music_path, music).await?;

        let (voice_path, voice_seconds) = self.resolve_voice(workdir.path(), voice_path).await?;

        let target = target_seconds(params, voice_seconds);
        let output = workdir
            .path()
            .join(format!("mix.{}", params.format.extension()));
        let invocation = MixInvocation {
            music: music_path,
            voice: voice_path,
            filter_graph: build_filter_graph(params, target),
            format: params.format,
            output: output.clone(),
        };

        tracing::info!(
            voice_seconds,
            target_seconds = target,
            format = params.format.extension(),
            "Mixing voice over music"
        );
        self.toolkit.run_mix(&invocation).await?;

        let bytes = match tokio::fs::read(&output).await {
            Ok(bytes) if !bytes.is_empty() => bytes,
            Ok(_) => {
                return Err(MixError::MissingOutput {
                    tool: "ffmpeg".to_string(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MixError::MissingOutput {
                    tool: "ffmpeg".to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        Ok(MixedAudio {
            bytes,
            format: params.format,
            mime_type: params.format.mime_type(),
            total_seconds: target,
        })
    }

    /// Probe, then re-encode and re-probe, then fall back to configuration
    ///
    /// Returns the voice file to mix from, which is the re-encoded copy when
    /// that recovery step produced the duration.
    async fn resolve_voice(
        &self,
        workdir: &Path,
        voice_path: PathBuf,
    ) -> Result<(PathBuf, f64), MixError> {
        if let Some(secs) = self.toolkit.probe_duration(&voice_path).await {
            return Ok((voice_path, secs));
        }

        let reencoded = workdir.join("voice_reencoded.wav");
        match self.toolkit.reencode_to_wav(&voice_path, &reencoded).await {
            Ok(()) if non_empty(&reencoded).await => {
                if let Some(secs) = self.toolkit.probe_duration(&reencoded).await {
                    tracing::info!(voice_seconds = secs, "Voice duration recovered after re-encode");
                    return Ok((reencoded, secs));
                }
            }
            Ok(()) => tracing::warn!("Voice re-encode produced no output"),
            Err(e) => tracing::warn!(error = %e, "Voice re-encode failed"),
        }

        match self.duration_fallback_secs {
            Some(secs) => {
                tracing::warn!(voice_seconds = secs, "Using configured voice duration fallback");
                Ok((voice_path, secs))
            }
            None => Err(MixError::DurationUndeterminable),
        }
    }
}

async fn non_empty(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.len() > 0)
        .unwrap_or(false)
}
