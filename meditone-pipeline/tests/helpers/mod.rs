//! Shared fixtures for the pipeline integration tests
//!
//! Fake collaborators stand in for the generation services and storage; a
//! fake media toolkit stands in for ffmpeg so the tests run anywhere.

#![allow(dead_code)]

use async_trait::async_trait;
use meditone_common::db::init_memory_database;
use meditone_common::events::EventBus;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

use meditone_pipeline::audio::{AudioMixer, MediaToolkit, MixInvocation};
use meditone_pipeline::audio::MixError;
use meditone_pipeline::db::meditations;
use meditone_pipeline::models::{
    CandidateTrack, ConversionStatus, ExternalMusicState, MusicJobRequest, MusicTaskStatus,
    NewMeditation, PipelineState, StageTask,
};
use meditone_pipeline::queue::{self, Backoff, StagePolicies, WorkerPool};
use meditone_pipeline::reconciler::ConversionPolling;
use meditone_pipeline::services::{
    ArtifactFetcher, MusicGenerator, ObjectStorage, ScriptWriter, ServiceError, VoiceSynthesizer,
};
use meditone_pipeline::{Collaborators, PipelineContext, PipelineSettings};

pub const EXTERNAL_TASK_ID: &str = "suno-task-1";
pub const SCRIPT: &str = "Breathe in slowly, Ada. Let the day settle.";

/// Text generation fake: scripted replies, then `SCRIPT` forever
#[derive(Default)]
pub struct FakeScriptWriter {
    replies: Mutex<VecDeque<Result<String, ServiceError>>>,
    pub prompts: Mutex<Vec<String>>,
}

impl FakeScriptWriter {
    pub fn with_replies(replies: Vec<Result<String, ServiceError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ScriptWriter for FakeScriptWriter {
    async fn generate(&self, prompt: &str) -> Result<String, ServiceError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(SCRIPT.to_string()))
    }
}

/// Voice fake returning one tenth of a second of headerless 16-bit PCM
///
/// The first sample is -1 (`FF FF`), as in a near-silent lead-in.
#[derive(Default)]
pub struct FakeVoice {
    pub calls: Mutex<u32>,
}

#[async_trait]
impl VoiceSynthesizer for FakeVoice {
    async fn synthesize(&self, _text: &str) -> Result<Vec<u8>, ServiceError> {
        *self.calls.lock().unwrap() += 1;
        let mut pcm = vec![0xFF, 0xFF];
        pcm.extend((2..9600u32).map(|i| (i % 251) as u8));
        Ok(pcm)
    }
}

/// Pop the next scripted reply; the last one repeats
fn next_reply<T: Clone>(replies: &Mutex<VecDeque<T>>) -> Option<T> {
    let mut replies = replies.lock().unwrap();
    if replies.len() > 1 {
        replies.pop_front()
    } else {
        replies.front().cloned()
    }
}

/// Music fake: status and conversion replies are consumed in order, the
/// last one repeats. Without conversion replies every conversion is ready.
pub struct FakeMusic {
    statuses: Mutex<VecDeque<MusicTaskStatus>>,
    conversion_statuses: Mutex<VecDeque<ConversionStatus>>,
    pub jobs: Mutex<Vec<MusicJobRequest>>,
    pub polls: Mutex<u32>,
    pub conversion_polls: Mutex<u32>,
    pub conversions: Mutex<Vec<(String, String)>>,
}

impl FakeMusic {
    pub fn with_statuses(statuses: Vec<MusicTaskStatus>) -> Self {
        Self {
            statuses: Mutex::new(statuses.into()),
            conversion_statuses: Mutex::new(VecDeque::new()),
            jobs: Mutex::new(Vec::new()),
            polls: Mutex::new(0),
            conversion_polls: Mutex::new(0),
            conversions: Mutex::new(Vec::new()),
        }
    }

    pub fn with_conversion_statuses(self, statuses: Vec<ConversionStatus>) -> Self {
        *self.conversion_statuses.lock().unwrap() = statuses.into();
        self
    }

    pub fn poll_count(&self) -> u32 {
        *self.polls.lock().unwrap()
    }

    pub fn conversion_poll_count(&self) -> u32 {
        *self.conversion_polls.lock().unwrap()
    }

    pub fn conversions(&self) -> Vec<(String, String)> {
        self.conversions.lock().unwrap().clone()
    }
}

#[async_trait]
impl MusicGenerator for FakeMusic {
    async fn start_job(&self, request: &MusicJobRequest) -> Result<String, ServiceError> {
        self.jobs.lock().unwrap().push(request.clone());
        Ok(EXTERNAL_TASK_ID.to_string())
    }

    async fn poll_status(&self, _external_task_id: &str) -> Result<MusicTaskStatus, ServiceError> {
        *self.polls.lock().unwrap() += 1;
        Ok(next_reply(&self.statuses).unwrap_or_else(in_progress))
    }

    async fn request_lossless_conversion(
        &self,
        external_task_id: &str,
        track_id: &str,
    ) -> Result<String, ServiceError> {
        self.conversions
            .lock()
            .unwrap()
            .push((external_task_id.to_string(), track_id.to_string()));
        Ok(format!("conv-{}", track_id))
    }

    async fn poll_conversion_status(
        &self,
        conversion_task_id: &str,
    ) -> Result<ConversionStatus, ServiceError> {
        *self.conversion_polls.lock().unwrap() += 1;
        Ok(
            next_reply(&self.conversion_statuses).unwrap_or_else(|| ConversionStatus::Ready {
                download_url: format!("https://cdn.test/{}.wav", conversion_task_id),
            }),
        )
    }
}

/// Storage fake recording `(name, mime)` for every upload
///
/// Names starting with `failing_prefix` are refused with HTTP 503.
#[derive(Default)]
pub struct FakeStorage {
    pub uploads: Mutex<Vec<(String, String)>>,
    pub failing_prefix: Option<String>,
}

impl FakeStorage {
    pub fn uploads(&self) -> Vec<(String, String)> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    async fn upload(
        &self,
        local_path: &Path,
        name: &str,
        mime_type: &str,
    ) -> Result<String, ServiceError> {
        if let Some(prefix) = &self.failing_prefix {
            if name.starts_with(prefix.as_str()) {
                return Err(ServiceError::Http {
                    status: 503,
                    body: "storage unavailable".into(),
                });
            }
        }
        let bytes = tokio::fs::read(local_path).await?;
        assert!(!bytes.is_empty(), "uploaded {} empty", name);
        self.uploads
            .lock()
            .unwrap()
            .push((name.to_string(), mime_type.to_string()));
        Ok(format!("https://storage.test/{}", name))
    }
}

/// Fetcher fake returning a small payload for any URL, or refusing every
/// download with `failing_status`
#[derive(Default)]
pub struct FakeFetcher {
    pub urls: Mutex<Vec<String>>,
    pub failing_status: Option<u16>,
}

impl FakeFetcher {
    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArtifactFetcher for FakeFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, ServiceError> {
        self.urls.lock().unwrap().push(url.to_string());
        if let Some(status) = self.failing_status {
            return Err(ServiceError::Http {
                status,
                body: "download refused".into(),
            });
        }
        Ok(format!("audio bytes from {}", url).into_bytes())
    }
}

/// Media toolkit fake: every voice probes at `voice_secs`, mixing writes a
/// marker file and records the filter graph
pub struct FakeToolkit {
    pub voice_secs: f64,
    pub graphs: Mutex<Vec<String>>,
}

impl FakeToolkit {
    pub fn new(voice_secs: f64) -> Self {
        Self {
            voice_secs,
            graphs: Mutex::new(Vec::new()),
        }
    }

    pub fn graphs(&self) -> Vec<String> {
        self.graphs.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaToolkit for FakeToolkit {
    async fn probe_duration(&self, _path: &Path) -> Option<f64> {
        Some(self.voice_secs)
    }

    async fn reencode_to_wav(&self, input: &Path, output: &Path) -> Result<(), MixError> {
        tokio::fs::copy(input, output).await?;
        Ok(())
    }

    async fn run_mix(&self, invocation: &MixInvocation) -> Result<(), MixError> {
        self.graphs
            .lock()
            .unwrap()
            .push(invocation.filter_graph.clone());
        tokio::fs::write(&invocation.output, b"mixed meditation").await?;
        Ok(())
    }
}

pub fn in_progress() -> MusicTaskStatus {
    MusicTaskStatus {
        state: ExternalMusicState::InProgress,
        tracks: Vec::new(),
    }
}

pub fn candidate_tracks() -> Vec<CandidateTrack> {
    vec![
        CandidateTrack {
            id: "track-a".into(),
            audio_url: Some("https://cdn.test/a.mp3".into()),
            duration: Some(120.5),
        },
        CandidateTrack {
            id: "track-b".into(),
            audio_url: Some("https://cdn.test/b.mp3".into()),
            duration: Some(163.8),
        },
    ]
}

pub fn succeeded() -> MusicTaskStatus {
    MusicTaskStatus {
        state: ExternalMusicState::Succeeded,
        tracks: candidate_tracks(),
    }
}

pub fn new_meditation() -> NewMeditation {
    NewMeditation {
        first_name: "Ada".into(),
        email: "ada@example.com".into(),
        birth_date: "1990-04-12".into(),
        style: "Zen".into(),
        goals: "Sleep better".into(),
        challenges: "Racing thoughts".into(),
    }
}

/// One pipeline instance over an in-memory database and a scratch directory
pub struct Harness {
    pub ctx: Arc<PipelineContext>,
    pub workers: WorkerPool,
    pub scripts: Arc<FakeScriptWriter>,
    pub voice: Arc<FakeVoice>,
    pub music: Arc<FakeMusic>,
    pub storage: Arc<FakeStorage>,
    pub fetcher: Arc<FakeFetcher>,
    pub toolkit: Arc<FakeToolkit>,
    pub temp: TempDir,
}

pub struct HarnessBuilder {
    scripts: FakeScriptWriter,
    music: FakeMusic,
    storage: FakeStorage,
    fetcher: FakeFetcher,
    poll_limit: u32,
    callback_grace: Duration,
    webhook_token: Option<String>,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            scripts: FakeScriptWriter::default(),
            music: FakeMusic::with_statuses(vec![in_progress(), succeeded()]),
            storage: FakeStorage::default(),
            fetcher: FakeFetcher::default(),
            poll_limit: 50,
            callback_grace: Duration::ZERO,
            webhook_token: None,
        }
    }

    pub fn scripts(mut self, scripts: FakeScriptWriter) -> Self {
        self.scripts = scripts;
        self
    }

    pub fn music_statuses(self, statuses: Vec<MusicTaskStatus>) -> Self {
        *self.music.statuses.lock().unwrap() = statuses.into();
        self
    }

    pub fn conversion_statuses(mut self, statuses: Vec<ConversionStatus>) -> Self {
        self.music = self.music.with_conversion_statuses(statuses);
        self
    }

    /// Delay before the final check after a conversion gives up
    pub fn callback_grace(mut self, grace: Duration) -> Self {
        self.callback_grace = grace;
        self
    }

    pub fn failing_uploads(mut self, prefix: &str) -> Self {
        self.storage.failing_prefix = Some(prefix.to_string());
        self
    }

    pub fn failing_downloads(mut self, status: u16) -> Self {
        self.fetcher.failing_status = Some(status);
        self
    }

    pub fn poll_limit(mut self, poll_limit: u32) -> Self {
        self.poll_limit = poll_limit;
        self
    }

    pub fn webhook_token(mut self, token: &str) -> Self {
        self.webhook_token = Some(token.to_string());
        self
    }

    pub async fn build(self) -> Harness {
        let pool = init_memory_database().await.unwrap();
        let temp = TempDir::new().unwrap();

        let scripts = Arc::new(self.scripts);
        let voice = Arc::new(FakeVoice::default());
        let music = Arc::new(self.music);
        let storage = Arc::new(self.storage);
        let fetcher = Arc::new(self.fetcher);
        let toolkit = Arc::new(FakeToolkit::new(12.3));

        let collaborators = Collaborators {
            script_writer: scripts.clone(),
            voice: voice.clone(),
            music: music.clone(),
            storage: storage.clone(),
            fetcher: fetcher.clone(),
        };

        let mut settings = PipelineSettings::new(temp.path());
        settings.policies = StagePolicies::default()
            .with_backoff(Backoff::immediate())
            .with_poll_limit(self.poll_limit);
        settings.conversion = ConversionPolling {
            max_tries: 3,
            backoff: Backoff::immediate(),
            callback_grace: self.callback_grace,
        };
        settings.webhook_token = self.webhook_token;

        let mixer = AudioMixer::new(toolkit.clone(), temp.path(), None);
        let ctx = Arc::new(PipelineContext::new(
            pool,
            collaborators,
            mixer,
            settings,
            EventBus::new(256),
        ));
        let workers = WorkerPool::new(ctx.clone(), 1).with_idle_interval(Duration::from_millis(10));

        Harness {
            ctx,
            workers,
            scripts,
            voice,
            music,
            storage,
            fetcher,
            toolkit,
            temp,
        }
    }
}

impl Harness {
    /// Create a request and queue its first stage, as intake does
    pub async fn submit(&self) -> Uuid {
        let id = Uuid::new_v4();
        let mut tx = self.ctx.pool.begin().await.unwrap();
        meditations::insert(&mut *tx, id, &new_meditation())
            .await
            .unwrap();
        queue::enqueue(
            &mut *tx,
            &StageTask::Script { meditation_id: id },
            Duration::ZERO,
        )
        .await
        .unwrap();
        assert!(meditations::advance(
            &mut *tx,
            id,
            PipelineState::Created,
            PipelineState::ScriptPending
        )
        .await
        .unwrap());
        tx.commit().await.unwrap();
        id
    }

    /// Run script, voice and music kickoff; the request then awaits music
    pub async fn advance_to_music_pending(&self) -> Uuid {
        let id = self.submit().await;
        assert_eq!(self.workers.run_until_idle(3).await.unwrap(), 3);
        let meditation = meditations::get(&self.ctx.pool, id).await.unwrap();
        assert_eq!(meditation.state, PipelineState::MusicPending);
        id
    }

    pub async fn run_all(&self) -> usize {
        self.workers.run_until_idle(200).await.unwrap()
    }

    /// Files left in the scratch directory
    pub fn leftover_files(&self) -> Vec<String> {
        std::fs::read_dir(self.temp.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect()
    }
}
