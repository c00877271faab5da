//! External media tools (ffmpeg / ffprobe)
//!
//! `MediaToolkit` is the seam the mixer talks through, so tests can replace
//! subprocesses with canned behaviour.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;

use super::{MixError, OutputFormat};

const PROBE_TIMEOUT: Duration = Duration::from_secs(15);
const REENCODE_TIMEOUT: Duration = Duration::from_secs(60);

/// One ffmpeg mix run
#[derive(Debug, Clone)]
pub struct MixInvocation {
    pub music: PathBuf,
    pub voice: PathBuf,
    pub filter_graph: String,
    pub format: OutputFormat,
    pub output: PathBuf,
}

impl MixInvocation {
    /// ffmpeg arguments: music looped forever as input 0, voice as input 1
    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-y".into(),
            "-stream_loop".into(),
            "-1".into(),
            "-i".into(),
            self.music.display().to_string(),
            "-i".into(),
            self.voice.display().to_string(),
            "-filter_complex".into(),
            self.filter_graph.clone(),
            "-map".into(),
            "[aout]".into(),
            "-ac".into(),
            "2".into(),
            "-ar".into(),
            "44100".into(),
        ];
        args.extend(self.format.codec_args().iter().map(|s| s.to_string()));
        args.push(self.output.display().to_string());
        args
    }
}

#[async_trait]
pub trait MediaToolkit: Send + Sync {
    /// Duration in seconds, `None` when unknown or not positive
    async fn probe_duration(&self, path: &Path) -> Option<f64>;

    /// Re-encode to 44.1 kHz stereo 16-bit WAV
    async fn reencode_to_wav(&self, input: &Path, output: &Path) -> Result<(), MixError>;

    async fn run_mix(&self, invocation: &MixInvocation) -> Result<(), MixError>;
}

/// Subprocess-backed toolkit
pub struct FfmpegToolkit {
    ffmpeg_bin: String,
    ffprobe_bin: String,
    mix_timeout: Duration,
}

impl FfmpegToolkit {
    pub fn new(ffmpeg_bin: impl Into<String>, ffprobe_bin: impl Into<String>, mix_timeout: Duration) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
            ffprobe_bin: ffprobe_bin.into(),
            mix_timeout,
        }
    }

    async fn run(&self, bin: &str, args: &[String], limit: Duration) -> Result<Output, MixError> {
        tracing::debug!(tool = bin, ?args, "Running media tool");

        let child = Command::new(bin)
            .args(args)
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(limit, child).await {
            Err(_) => Err(MixError::Timeout {
                tool: bin.to_string(),
                secs: limit.as_secs(),
            }),
            Ok(Err(e)) => Err(MixError::Spawn {
                tool: bin.to_string(),
                message: e.to_string(),
            }),
            Ok(Ok(output)) if !output.status.success() => Err(MixError::Subprocess {
                tool: bin.to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
            Ok(Ok(output)) => Ok(output),
        }
    }
}

/// Parse ffprobe's bare duration output
fn parse_probe_output(stdout: &[u8]) -> Option<f64> {
    String::from_utf8_lossy(stdout)
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs > 0.0)
}

#[async_trait]
impl MediaToolkit for FfmpegToolkit {
    async fn probe_duration(&self, path: &Path) -> Option<f64> {
        let args = vec![
            "-v".to_string(),
            "error".to_string(),
            "-show_entries".to_string(),
            "format=duration".to_string(),
            "-of".to_string(),
            "default=noprint_wrappers=1:nokey=1".to_string(),
            path.display().to_string(),
        ];

        match self.run(&self.ffprobe_bin, &args, PROBE_TIMEOUT).await {
            Ok(output) => parse_probe_output(&output.stdout),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Duration probe failed");
                None
            }
        }
    }

    async fn reencode_to_wav(&self, input: &Path, output: &Path) -> Result<(), MixError> {
        let args = vec![
            "-y".to_string(),
            "-i".to_string(),
            input.display().to_string(),
            "-ac".to_string(),
            "2".to_string(),
            "-ar".to_string(),
            "44100".to_string(),
            "-c:a".to_string(),
            "pcm_s16le".to_string(),
            output.display().to_string(),
        ];
        self.run(&self.ffmpeg_bin, &args, REENCODE_TIMEOUT).await?;
        Ok(())
    }

    async fn run_mix(&self, invocation: &MixInvocation) -> Result<(), MixError> {
        self.run(&self.ffmpeg_bin, &invocation.args(), self.mix_timeout)
            .await?;
        Ok(())
    }
}
