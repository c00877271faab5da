//! Meditation request record and its pipeline state machine
//!
//! Created → ScriptPending → ScriptDone → VoicePending → VoiceDone →
//! MusicPending → MusicDone → MixPending → Complete, with Failed reachable
//! from every `*Pending` state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Pipeline state of one meditation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Created,
    ScriptPending,
    ScriptDone,
    VoicePending,
    VoiceDone,
    MusicPending,
    MusicDone,
    MixPending,
    Complete,
    Failed,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Created => "created",
            PipelineState::ScriptPending => "script_pending",
            PipelineState::ScriptDone => "script_done",
            PipelineState::VoicePending => "voice_pending",
            PipelineState::VoiceDone => "voice_done",
            PipelineState::MusicPending => "music_pending",
            PipelineState::MusicDone => "music_done",
            PipelineState::MixPending => "mix_pending",
            PipelineState::Complete => "complete",
            PipelineState::Failed => "failed",
        }
    }

    /// Complete and Failed absorb every later transition
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Complete | PipelineState::Failed)
    }

    /// The single state this one may advance to on success
    pub fn successor(&self) -> Option<PipelineState> {
        match self {
            PipelineState::Created => Some(PipelineState::ScriptPending),
            PipelineState::ScriptPending => Some(PipelineState::ScriptDone),
            PipelineState::ScriptDone => Some(PipelineState::VoicePending),
            PipelineState::VoicePending => Some(PipelineState::VoiceDone),
            PipelineState::VoiceDone => Some(PipelineState::MusicPending),
            PipelineState::MusicPending => Some(PipelineState::MusicDone),
            PipelineState::MusicDone => Some(PipelineState::MixPending),
            PipelineState::MixPending => Some(PipelineState::Complete),
            PipelineState::Complete | PipelineState::Failed => None,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineState {
    type Err = meditone_common::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "created" => PipelineState::Created,
            "script_pending" => PipelineState::ScriptPending,
            "script_done" => PipelineState::ScriptDone,
            "voice_pending" => PipelineState::VoicePending,
            "voice_done" => PipelineState::VoiceDone,
            "music_pending" => PipelineState::MusicPending,
            "music_done" => PipelineState::MusicDone,
            "mix_pending" => PipelineState::MixPending,
            "complete" => PipelineState::Complete,
            "failed" => PipelineState::Failed,
            other => {
                return Err(meditone_common::Error::Internal(format!(
                    "Unknown pipeline state: {}",
                    other
                )))
            }
        })
    }
}

/// Local view of the external music task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MusicStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
}

impl MusicStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MusicStatus::Pending => "pending",
            MusicStatus::InProgress => "in_progress",
            MusicStatus::Complete => "complete",
            MusicStatus::Failed => "failed",
        }
    }
}

impl FromStr for MusicStatus {
    type Err = meditone_common::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => MusicStatus::Pending,
            "in_progress" => MusicStatus::InProgress,
            "complete" => MusicStatus::Complete,
            "failed" => MusicStatus::Failed,
            other => {
                return Err(meditone_common::Error::Internal(format!(
                    "Unknown music status: {}",
                    other
                )))
            }
        })
    }
}

/// Which reconciliation path moved the music task to complete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPath {
    Poller,
    Webhook,
}

impl CompletionPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionPath::Poller => "poller",
            CompletionPath::Webhook => "webhook",
        }
    }
}

impl FromStr for CompletionPath {
    type Err = meditone_common::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "poller" => Ok(CompletionPath::Poller),
            "webhook" => Ok(CompletionPath::Webhook),
            other => Err(meditone_common::Error::Internal(format!(
                "Unknown completion path: {}",
                other
            ))),
        }
    }
}

/// Intake fields of a new request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMeditation {
    pub first_name: String,
    pub email: String,
    /// `YYYY-MM-DD`
    pub birth_date: String,
    pub style: String,
    pub goals: String,
    pub challenges: String,
}

/// Persisted meditation request
///
/// Artifact references are filled in by the stages in order; each stage
/// writes only its own field.
#[derive(Debug, Clone, Serialize)]
pub struct Meditation {
    pub id: Uuid,
    pub first_name: String,
    pub email: String,
    pub birth_date: Option<String>,
    pub style: Option<String>,
    pub goals: Option<String>,
    pub challenges: Option<String>,
    pub script_text: Option<String>,
    pub voice_url: Option<String>,
    pub music_url: Option<String>,
    /// Correlation key shared by the poller and the webhook
    pub music_task_id: Option<String>,
    pub music_status: MusicStatus,
    pub music_completed_via: Option<CompletionPath>,
    pub meditation_url: Option<String>,
    pub state: PipelineState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trips_through_text() {
        let all = [
            PipelineState::Created,
            PipelineState::ScriptPending,
            PipelineState::ScriptDone,
            PipelineState::VoicePending,
            PipelineState::VoiceDone,
            PipelineState::MusicPending,
            PipelineState::MusicDone,
            PipelineState::MixPending,
            PipelineState::Complete,
            PipelineState::Failed,
        ];
        for state in all {
            assert_eq!(state.as_str().parse::<PipelineState>().unwrap(), state);
        }
    }

    #[test]
    fn test_successor_chain_is_linear() {
        let mut state = PipelineState::Created;
        let mut visited = vec![state];
        while let Some(next) = state.successor() {
            visited.push(next);
            state = next;
        }
        assert_eq!(visited.len(), 9);
        assert_eq!(state, PipelineState::Complete);
        assert!(PipelineState::Failed.successor().is_none());
    }

    #[test]
    fn test_terminal_states() {
        assert!(PipelineState::Complete.is_terminal());
        assert!(PipelineState::Failed.is_terminal());
        assert!(!PipelineState::MusicPending.is_terminal());
    }

    #[test]
    fn test_unknown_state_rejected() {
        assert!("half_done".parse::<PipelineState>().is_err());
        assert!("done".parse::<MusicStatus>().is_err());
    }
}
