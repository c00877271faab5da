//! Data models for meditone-pipeline

pub mod meditation;
pub mod music;
pub mod task;

pub use meditation::{CompletionPath, Meditation, MusicStatus, NewMeditation, PipelineState};
pub use music::{
    select_best_track, CandidateTrack, ConversionStatus, ExternalMusicState, MusicJobRequest,
    MusicTaskStatus,
};
pub use task::{mix_handoffs, ArtifactLocation, MusicSource, Stage, StageTask, TaskEnvelope};
