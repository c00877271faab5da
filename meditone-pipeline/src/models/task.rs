//! Stage task messages
//!
//! A task is immutable once enqueued. Artifacts travel either by local path
//! (an explicit temp-file hand-off) or by a retrievable URL.

use super::{CandidateTrack, PipelineState};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

/// Unit of work names, one per handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Script,
    Voice,
    MusicKickoff,
    MusicPoll,
    MusicStore,
    Mix,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Script,
        Stage::Voice,
        Stage::MusicKickoff,
        Stage::MusicPoll,
        Stage::MusicStore,
        Stage::Mix,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Script => "script",
            Stage::Voice => "voice",
            Stage::MusicKickoff => "music_kickoff",
            Stage::MusicPoll => "music_poll",
            Stage::MusicStore => "music_store",
            Stage::Mix => "mix",
        }
    }

    /// Request state in which this stage is allowed to run
    pub fn owning_state(&self) -> PipelineState {
        match self {
            Stage::Script => PipelineState::ScriptPending,
            Stage::Voice => PipelineState::VoicePending,
            Stage::MusicKickoff | Stage::MusicPoll | Stage::MusicStore => {
                PipelineState::MusicPending
            }
            Stage::Mix => PipelineState::MixPending,
        }
    }

    /// Stages whose terminal failure also fails the external music task
    pub fn fails_music(&self) -> bool {
        matches!(self, Stage::MusicKickoff | Stage::MusicPoll)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = meditone_common::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| meditone_common::Error::Internal(format!("Unknown stage: {}", s)))
    }
}

/// Where an audio artifact can be read from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ArtifactLocation {
    /// Temp file handed off from an earlier stage
    LocalPath(PathBuf),
    /// Public storage reference
    Url(String),
}

impl ArtifactLocation {
    pub fn local_path(&self) -> Option<&Path> {
        match self {
            ArtifactLocation::LocalPath(path) => Some(path),
            ArtifactLocation::Url(_) => None,
        }
    }
}

/// Music artifact as delivered by whichever reconciliation path won
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MusicSource {
    /// Downloaded lossless file (poller path)
    LocalFile(PathBuf),
    /// Candidate list from the final callback (webhook path)
    Tracks(Vec<CandidateTrack>),
}

/// Stage task payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageTask {
    Script {
        meditation_id: Uuid,
    },
    Voice {
        meditation_id: Uuid,
        script: String,
    },
    MusicKickoff {
        meditation_id: Uuid,
        voice_path: PathBuf,
    },
    MusicPoll {
        meditation_id: Uuid,
        voice_path: PathBuf,
        external_task_id: String,
        /// 1-based count of status polls, bounded by the poll limit
        poll_attempt: u32,
        /// Last look after a lossless conversion gave up: fails the request
        /// unless a callback claimed the completion in the meantime
        #[serde(default)]
        final_check: bool,
    },
    MusicStore {
        meditation_id: Uuid,
        voice: ArtifactLocation,
        music: MusicSource,
    },
    Mix {
        meditation_id: Uuid,
        voice: ArtifactLocation,
        music: ArtifactLocation,
    },
}

impl StageTask {
    pub fn stage(&self) -> Stage {
        match self {
            StageTask::Script { .. } => Stage::Script,
            StageTask::Voice { .. } => Stage::Voice,
            StageTask::MusicKickoff { .. } => Stage::MusicKickoff,
            StageTask::MusicPoll { .. } => Stage::MusicPoll,
            StageTask::MusicStore { .. } => Stage::MusicStore,
            StageTask::Mix { .. } => Stage::Mix,
        }
    }

    pub fn meditation_id(&self) -> Uuid {
        match self {
            StageTask::Script { meditation_id }
            | StageTask::Voice { meditation_id, .. }
            | StageTask::MusicKickoff { meditation_id, .. }
            | StageTask::MusicPoll { meditation_id, .. }
            | StageTask::MusicStore { meditation_id, .. }
            | StageTask::Mix { meditation_id, .. } => *meditation_id,
        }
    }

    /// Temp files this task owns; deleted if the task fails terminally
    pub fn handoff_paths(&self) -> Vec<PathBuf> {
        match self {
            StageTask::Script { .. } | StageTask::Voice { .. } => Vec::new(),
            StageTask::MusicKickoff { voice_path, .. }
            | StageTask::MusicPoll { voice_path, .. } => vec![voice_path.clone()],
            StageTask::MusicStore { voice, music, .. } => {
                let mut paths: Vec<PathBuf> =
                    voice.local_path().map(Path::to_path_buf).into_iter().collect();
                if let MusicSource::LocalFile(path) = music {
                    paths.push(path.clone());
                }
                paths
            }
            StageTask::Mix { voice, music, .. } => mix_handoffs(voice, music),
        }
    }
}

/// Local files among the Mix inputs
pub fn mix_handoffs(voice: &ArtifactLocation, music: &ArtifactLocation) -> Vec<PathBuf> {
    voice
        .local_path()
        .into_iter()
        .chain(music.local_path())
        .map(Path::to_path_buf)
        .collect()
}

/// A claimed task together with its queue bookkeeping
#[derive(Debug, Clone, PartialEq)]
pub struct TaskEnvelope {
    pub id: Uuid,
    /// 1-based delivery attempt
    pub attempt: u32,
    pub task: StageTask,
}
