//! Explicitly wired dependencies shared by the workers and the HTTP surface
//!
//! Nothing in the pipeline reaches for a global: every handler receives the
//! `PipelineContext` it runs against, which is how tests substitute fakes.

use meditone_common::events::EventBus;
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::audio::{AudioMixer, MixParams, VoiceFormat};
use crate::queue::{StagePolicies, TaskQueue};
use crate::reconciler::ConversionPolling;
use crate::services::{
    ArtifactFetcher, MusicGenerator, ObjectStorage, ScriptWriter, VoiceSynthesizer,
};

/// External generation and storage collaborators
#[derive(Clone)]
pub struct Collaborators {
    pub script_writer: Arc<dyn ScriptWriter>,
    pub voice: Arc<dyn VoiceSynthesizer>,
    pub music: Arc<dyn MusicGenerator>,
    pub storage: Arc<dyn ObjectStorage>,
    pub fetcher: Arc<dyn ArtifactFetcher>,
}

/// Per-external-task reconcile lock timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSettings {
    /// Lock held at most this long before another path may take it over
    pub ttl: Duration,
    /// Bounded wait for acquisition
    pub wait: Duration,
    pub retry_interval: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            wait: Duration::from_secs(5),
            retry_interval: Duration::from_millis(50),
        }
    }
}

/// Run-wide constants for one pipeline instance
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Scoped temp files handed from stage to stage live here
    pub temp_dir: PathBuf,
    pub mix: MixParams,
    pub voice_format: VoiceFormat,
    pub conversion: ConversionPolling,
    pub lock: LockSettings,
    pub policies: StagePolicies,
    /// Shared secret the music webhook must present, when set
    pub webhook_token: Option<String>,
}

impl PipelineSettings {
    pub fn new(temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            temp_dir: temp_dir.into(),
            mix: MixParams::default(),
            voice_format: VoiceFormat::default(),
            conversion: ConversionPolling::default(),
            lock: LockSettings::default(),
            policies: StagePolicies::default(),
            webhook_token: None,
        }
    }
}

pub struct PipelineContext {
    pub pool: SqlitePool,
    pub queue: TaskQueue,
    pub collaborators: Collaborators,
    pub mixer: AudioMixer,
    pub settings: PipelineSettings,
    pub event_bus: EventBus,
}

impl PipelineContext {
    pub fn new(
        pool: SqlitePool,
        collaborators: Collaborators,
        mixer: AudioMixer,
        settings: PipelineSettings,
        event_bus: EventBus,
    ) -> Self {
        Self {
            queue: TaskQueue::new(pool.clone()),
            pool,
            collaborators,
            mixer,
            settings,
            event_bus,
        }
    }

    /// Unique temp path for a hand-off file
    pub fn temp_path(&self, prefix: &str, extension: &str) -> PathBuf {
        self.settings
            .temp_dir
            .join(format!("{}_{}.{}", prefix, uuid::Uuid::new_v4(), extension))
    }
}
