//! Audio handling: voice payload normalization and the voice/music mixer
//!
//! The mixer is stateless apart from its toolkit and scratch directory:
//! two byte buffers plus `MixParams` in, one encoded buffer out.

pub mod graph;
pub mod mixer;
pub mod toolkit;
pub mod wav;

pub use mixer::{AudioMixer, MixedAudio};
pub use toolkit::{FfmpegToolkit, MediaToolkit, MixInvocation};
pub use wav::{detect_container, normalize_voice_payload, AudioContainer, VoiceFormat};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Encoded output of a mix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Mp3,
    Wav,
}

impl OutputFormat {
    /// `mp3` selects MP3; any other name selects WAV
    pub fn from_name(name: &str) -> Self {
        if name.trim().eq_ignore_ascii_case("mp3") {
            OutputFormat::Mp3
        } else {
            OutputFormat::Wav
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Mp3 => "mp3",
            OutputFormat::Wav => "wav",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            OutputFormat::Mp3 => "audio/mpeg",
            OutputFormat::Wav => "audio/wav",
        }
    }

    /// Encoder arguments for ffmpeg
    pub fn codec_args(&self) -> &'static [&'static str] {
        match self {
            OutputFormat::Mp3 => &["-c:a", "libmp3lame", "-b:a", "192k"],
            OutputFormat::Wav => &["-c:a", "pcm_s16le"],
        }
    }
}

/// Timing and balance of one mix
///
/// Volumes are linear gain multipliers applied once, as the mix weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixParams {
    /// Music-only lead-in before the voice starts
    pub offset_ms: u64,
    /// Music continuing after the voice ends
    pub tail_ms: u64,
    pub voice_volume: f64,
    pub music_volume: f64,
    pub fade_out: bool,
    pub fade_ms: u64,
    pub format: OutputFormat,
}

impl Default for MixParams {
    fn default() -> Self {
        Self {
            offset_ms: 5000,
            tail_ms: 5000,
            voice_volume: 0.85,
            music_volume: 0.15,
            fade_out: true,
            fade_ms: 5000,
            format: OutputFormat::Mp3,
        }
    }
}

/// Mixer failure
#[derive(Debug, Error)]
pub enum MixError {
    #[error("Voice input is empty, cannot mix")]
    EmptyVoice,

    #[error("Music input is empty, cannot mix")]
    EmptyMusic,

    #[error(
        "Could not determine voice duration. Ensure ffmpeg/ffprobe are available \
         (FFMPEG_BIN / FFPROBE_BIN) or configure AUDIO_DURATION_FALLBACK"
    )]
    DurationUndeterminable,

    #[error("Failed to launch {tool}: {message}")]
    Spawn { tool: String, message: String },

    #[error("{tool} exited with {code:?}: {stderr}")]
    Subprocess {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{tool} timed out after {secs}s")]
    Timeout { tool: String, secs: u64 },

    #[error("{tool} produced no output file")]
    MissingOutput { tool: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MixError {
    /// Only resource hiccups are worth retrying; bad input stays bad
    pub fn is_transient(&self) -> bool {
        matches!(self, MixError::Timeout { .. } | MixError::Io(_))
    }
}
