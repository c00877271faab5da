//! Music generation value objects
//!
//! These mirror the external music task lifecycle. None of them is stored as
//! a first-class row; they are rebuilt from each poll or callback.

use serde::{Deserialize, Serialize};

/// External music task lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalMusicState {
    Pending,
    InProgress,
    Succeeded,
    /// Terminal failure carrying the upstream status text
    Failed(String),
}

impl ExternalMusicState {
    /// Map the upstream status string onto the lifecycle
    ///
    /// Intermediate `*_SUCCESS` phases (lyrics or first track ready) are
    /// still in progress; only `SUCCESS` means every track is ready.
    pub fn from_upstream(status: &str) -> Self {
        match status {
            "SUCCESS" => ExternalMusicState::Succeeded,
            "PENDING" | "" => ExternalMusicState::Pending,
            "TEXT_SUCCESS" | "FIRST_SUCCESS" | "RUNNING" | "PROCESSING" => {
                ExternalMusicState::InProgress
            }
            s if s.ends_with("FAILED") || s.ends_with("ERROR") || s.ends_with("EXCEPTION") => {
                ExternalMusicState::Failed(s.to_string())
            }
            _ => ExternalMusicState::InProgress,
        }
    }
}

/// One generated candidate track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateTrack {
    pub id: String,
    pub audio_url: Option<String>,
    /// Seconds
    pub duration: Option<f64>,
}

impl CandidateTrack {
    pub fn has_audio(&self) -> bool {
        self.audio_url
            .as_deref()
            .map(|url| !url.trim().is_empty())
            .unwrap_or(false)
    }

    fn duration_secs(&self) -> f64 {
        self.duration.unwrap_or(0.0)
    }
}

/// Result of polling an external music task
#[derive(Debug, Clone, PartialEq)]
pub struct MusicTaskStatus {
    pub state: ExternalMusicState,
    pub tracks: Vec<CandidateTrack>,
}

/// Result of polling a lossless conversion task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversionStatus {
    Pending { status: String },
    Ready { download_url: String },
    Failed { status: String },
}

impl ConversionStatus {
    /// Statuses that stop the conversion loop early
    pub fn is_failure_status(status: &str) -> bool {
        matches!(status, "FAILED" | "ERROR" | "CALLBACK_EXCEPTION")
    }
}

/// Parameters for starting a music job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MusicJobRequest {
    /// Free-text style hint from the intake form
    pub style: String,
    pub title: String,
}

/// Pick the longest candidate that has a populated audio URL
///
/// Ties keep the earliest track.
pub fn select_best_track(tracks: &[CandidateTrack]) -> Option<&CandidateTrack> {
    tracks
        .iter()
        .filter(|track| track.has_audio())
        .fold(None, |best: Option<&CandidateTrack>, track| match best {
            Some(current) if current.duration_secs() >= track.duration_secs() => Some(current),
            _ => Some(track),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(id: &str, url: Option<&str>, duration: Option<f64>) -> CandidateTrack {
        CandidateTrack {
            id: id.to_string(),
            audio_url: url.map(str::to_string),
            duration,
        }
    }

    #[test]
    fn test_selects_longest_track() {
        let tracks = vec![
            track("a", Some("https://cdn/a.mp3"), Some(120.5)),
            track("b", Some("https://cdn/b.mp3"), Some(163.8)),
        ];
        assert_eq!(select_best_track(&tracks).unwrap().id, "b");
    }

    #[test]
    fn test_skips_tracks_without_audio() {
        let tracks = vec![
            track("long", None, Some(300.0)),
            track("blank", Some("  "), Some(250.0)),
            track("short", Some("https://cdn/s.mp3"), Some(90.0)),
        ];
        assert_eq!(select_best_track(&tracks).unwrap().id, "short");
    }

    #[test]
    fn test_tie_keeps_original_order() {
        let tracks = vec![
            track("first", Some("https://cdn/1.mp3"), Some(140.0)),
            track("second", Some("https://cdn/2.mp3"), Some(140.0)),
        ];
        assert_eq!(select_best_track(&tracks).unwrap().id, "first");
    }

    #[test]
    fn test_missing_duration_counts_as_zero() {
        let tracks = vec![
            track("unknown", Some("https://cdn/u.mp3"), None),
            track("known", Some("https://cdn/k.mp3"), Some(1.0)),
        ];
        assert_eq!(select_best_track(&tracks).unwrap().id, "known");
    }

    #[test]
    fn test_no_audio_means_no_selection() {
        assert!(select_best_track(&[]).is_none());
        assert!(select_best_track(&[track("x", None, Some(10.0))]).is_none());
    }

    #[test]
    fn test_upstream_state_mapping() {
        assert_eq!(
            ExternalMusicState::from_upstream("SUCCESS"),
            ExternalMusicState::Succeeded
        );
        assert_eq!(
            ExternalMusicState::from_upstream("PENDING"),
            ExternalMusicState::Pending
        );
        assert_eq!(
            ExternalMusicState::from_upstream("FIRST_SUCCESS"),
            ExternalMusicState::InProgress
        );
        assert_eq!(
            ExternalMusicState::from_upstream("GENERATE_AUDIO_FAILED"),
            ExternalMusicState::Failed("GENERATE_AUDIO_FAILED".to_string())
        );
        assert_eq!(
            ExternalMusicState::from_upstream("SENSITIVE_WORD_ERROR"),
            ExternalMusicState::Failed("SENSITIVE_WORD_ERROR".to_string())
        );
    }
}
