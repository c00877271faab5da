//! Voice payload normalization
//!
//! Speech synthesis may hand back a finished container or bare PCM. Bare PCM
//! is wrapped in a WAV header so every downstream consumer sees a playable
//! file.

use hound::{SampleFormat, WavSpec, WavWriter};
use std::io::Cursor;

/// Raw PCM layout assumed for headerless voice payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoiceFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl Default for VoiceFormat {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 1,
            bits_per_sample: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioContainer {
    Wav,
    Mp3,
    Ogg,
    Flac,
    RawPcm,
}

impl AudioContainer {
    pub fn extension(&self) -> &'static str {
        match self {
            AudioContainer::Wav | AudioContainer::RawPcm => "wav",
            AudioContainer::Mp3 => "mp3",
            AudioContainer::Ogg => "ogg",
            AudioContainer::Flac => "flac",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            AudioContainer::Wav | AudioContainer::RawPcm => "audio/wav",
            AudioContainer::Mp3 => "audio/mpeg",
            AudioContainer::Ogg => "audio/ogg",
            AudioContainer::Flac => "audio/flac",
        }
    }
}

/// Identify the container from magic bytes
///
/// Only multi-byte signatures count. A bare MPEG frame sync (`FF Ex`) is
/// not trusted: quiet 16-bit PCM starting with sample -1 is `FF FF`.
pub fn detect_container(bytes: &[u8]) -> AudioContainer {
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE" {
        AudioContainer::Wav
    } else if bytes.starts_with(b"ID3") {
        AudioContainer::Mp3
    } else if bytes.starts_with(b"OggS") {
        AudioContainer::Ogg
    } else if bytes.starts_with(b"fLaC") {
        AudioContainer::Flac
    } else {
        AudioContainer::RawPcm
    }
}

/// Pass containers through; wrap raw little-endian PCM as WAV
///
/// Trailing bytes short of a whole sample are dropped. Sample widths other
/// than 8, 16, 24 and 32 bits are rejected.
pub fn normalize_voice_payload(
    bytes: Vec<u8>,
    format: &VoiceFormat,
) -> Result<(Vec<u8>, AudioContainer), hound::Error> {
    let container = detect_container(&bytes);
    if container != AudioContainer::RawPcm {
        return Ok((bytes, container));
    }
    if !matches!(format.bits_per_sample, 8 | 16 | 24 | 32) {
        return Err(hound::Error::Unsupported);
    }

    let spec = WavSpec {
        channels: format.channels,
        sample_rate: format.sample_rate,
        bits_per_sample: format.bits_per_sample,
        sample_format: SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(bytes.len() + 44));
    {
        let mut writer = WavWriter::new(&mut cursor, spec)?;
        match format.bits_per_sample {
            8 => {
                // WAV 8-bit is unsigned; hound takes signed i8 and offsets it
                for &b in &bytes {
                    writer.write_sample((b as i16 - 128) as i8)?;
                }
            }
            16 => {
                for pair in bytes.chunks_exact(2) {
                    writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
                }
            }
            24 => {
                for triple in bytes.chunks_exact(3) {
                    // Sign-extend from the top byte
                    let sample = i32::from_le_bytes([0, triple[0], triple[1], triple[2]]) >> 8;
                    writer.write_sample(sample)?;
                }
            }
            _ => {
                for quad in bytes.chunks_exact(4) {
                    writer.write_sample(i32::from_le_bytes([quad[0], quad[1], quad[2], quad[3]]))?;
                }
            }
        }
        writer.finalize()?;
    }

    tracing::debug!(
        pcm_bytes = bytes.len(),
        sample_rate = format.sample_rate,
        channels = format.channels,
        "Wrapped raw PCM voice payload as WAV"
    );

    Ok((cursor.into_inner(), AudioContainer::Wav))
}
