//! Passive webhook path
//!
//! The music service pushes callbacks for intermediate phases and for the
//! final result. Only a final, audio-bearing callback claims the completion.

use chrono::Utc;
use meditone_common::events::PipelineEvent;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use super::{claim_completion, with_lock, ReconcileError};
use crate::context::PipelineContext;
use crate::db::job_log::{self, JobLogEntry, LogLevel};
use crate::db::meditations::{self, FailGuard};
use crate::models::{
    ArtifactLocation, CandidateTrack, CompletionPath, MusicSource, MusicStatus, PipelineState,
    Stage, StageTask,
};

/// Callback phase that carries the finished tracks
pub const FINAL_PHASE: &str = "complete";

/// Inbound callback body
#[derive(Debug, Clone, Deserialize)]
pub struct MusicCallback {
    pub code: i64,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub data: Option<CallbackData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackData {
    #[serde(rename = "callbackType", alias = "callback_type", default)]
    pub callback_type: Option<String>,
    #[serde(alias = "taskId", default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub data: Option<Vec<CallbackTrack>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackTrack {
    #[serde(default)]
    pub id: String,
    #[serde(alias = "audioUrl", default)]
    pub audio_url: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
}

impl From<CallbackTrack> for CandidateTrack {
    fn from(track: CallbackTrack) -> Self {
        CandidateTrack {
            id: track.id,
            audio_url: track.audio_url,
            duration: track.duration,
        }
    }
}

impl MusicCallback {
    pub fn external_task_id(&self) -> Option<&str> {
        self.data
            .as_ref()
            .and_then(|data| data.task_id.as_deref())
            .filter(|id| !id.trim().is_empty())
    }

    pub fn phase(&self) -> Option<&str> {
        self.data.as_ref().and_then(|data| data.callback_type.as_deref())
    }

    pub fn tracks(&self) -> Vec<CandidateTrack> {
        self.data
            .as_ref()
            .and_then(|data| data.data.clone())
            .unwrap_or_default()
            .into_iter()
            .map(CandidateTrack::from)
            .collect()
    }

    /// Final phase with at least one populated audio URL
    pub fn is_final_with_audio(&self) -> bool {
        self.phase() == Some(FINAL_PHASE) && self.tracks().iter().any(CandidateTrack::has_audio)
    }
}

/// What the webhook did with a callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// No request carries this external task id
    UnknownTask,
    /// Request already complete, failed, or past the music stage
    AlreadyResolved,
    /// Non-200 code; request failed
    MarkedFailed,
    /// Intermediate phase recorded
    InProgress,
    /// This callback won the completion claim
    Claimed,
}

impl WebhookOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookOutcome::UnknownTask => "unknown_task",
            WebhookOutcome::AlreadyResolved => "already_resolved",
            WebhookOutcome::MarkedFailed => "marked_failed",
            WebhookOutcome::InProgress => "in_progress",
            WebhookOutcome::Claimed => "claimed",
        }
    }
}

/// Apply one callback under the reconcile lock for its task id
pub async fn handle_callback(
    ctx: &PipelineContext,
    callback: &MusicCallback,
) -> Result<WebhookOutcome, ReconcileError> {
    let Some(external_task_id) = callback.external_task_id() else {
        warn!(code = callback.code, "Music callback without task id ignored");
        return Ok(WebhookOutcome::UnknownTask);
    };

    with_lock(&ctx.pool, external_task_id, &ctx.settings.lock, || async {
        apply_locked(ctx, external_task_id, callback).await
    })
    .await
}

async fn apply_locked(
    ctx: &PipelineContext,
    external_task_id: &str,
    callback: &MusicCallback,
) -> Result<WebhookOutcome, ReconcileError> {
    let Some(meditation) = meditations::find_by_music_task(&ctx.pool, external_task_id).await?
    else {
        warn!(external_task_id, "Music callback for unknown task ignored");
        return Ok(WebhookOutcome::UnknownTask);
    };
    let meditation_id = meditation.id;

    if meditation.state != PipelineState::MusicPending
        || matches!(
            meditation.music_status,
            MusicStatus::Complete | MusicStatus::Failed
        )
    {
        debug!(
            meditation_id = %meditation_id,
            external_task_id,
            state = %meditation.state,
            "Music callback after resolution ignored"
        );
        return Ok(WebhookOutcome::AlreadyResolved);
    }

    if callback.code != 200 {
        let message = format!(
            "Music generation failed (code {}): {}",
            callback.code,
            callback.msg.as_deref().unwrap_or("no message")
        );
        let guard = FailGuard {
            from: PipelineState::MusicPending,
            fail_music: true,
            require_music_unclaimed: true,
        };

        let mut tx = ctx.pool.begin().await?;
        let failed = meditations::fail(&mut *tx, meditation_id, guard).await?;
        if failed {
            let entry = JobLogEntry::new(Stage::MusicPoll.as_str(), LogLevel::Error, &message)
                .meditation(meditation_id)
                .context(json!({
                    "external_task_id": external_task_id,
                    "code": callback.code,
                    "source": CompletionPath::Webhook.as_str(),
                }));
            job_log::record(&mut *tx, &entry).await?;
        }
        tx.commit().await?;

        if !failed {
            return Ok(WebhookOutcome::AlreadyResolved);
        }
        warn!(meditation_id = %meditation_id, external_task_id, "{}", message);
        ctx.event_bus.emit_lossy(PipelineEvent::StageFailed {
            meditation_id,
            stage: Stage::MusicPoll.as_str().to_string(),
            message,
            timestamp: Utc::now(),
        });
        return Ok(WebhookOutcome::MarkedFailed);
    }

    if !callback.is_final_with_audio() {
        if meditations::mark_music_in_progress(&ctx.pool, meditation_id).await? {
            ctx.event_bus.emit_lossy(PipelineEvent::MusicStatusChanged {
                meditation_id,
                external_task_id: external_task_id.to_string(),
                status: MusicStatus::InProgress.as_str().to_string(),
                timestamp: Utc::now(),
            });
        }
        debug!(
            meditation_id = %meditation_id,
            phase = callback.phase().unwrap_or("none"),
            "Intermediate music callback recorded"
        );
        return Ok(WebhookOutcome::InProgress);
    }

    let voice_url = meditation.voice_url.clone().ok_or_else(|| {
        ReconcileError::Invalid(format!("meditation {} has no voice reference", meditation_id))
    })?;
    let store = StageTask::MusicStore {
        meditation_id,
        voice: ArtifactLocation::Url(voice_url),
        music: MusicSource::Tracks(callback.tracks()),
    };

    if !claim_completion(&ctx.pool, meditation_id, CompletionPath::Webhook, &store).await? {
        return Ok(WebhookOutcome::AlreadyResolved);
    }

    info!(meditation_id = %meditation_id, external_task_id, "Webhook claimed music completion");
    ctx.event_bus.emit_lossy(PipelineEvent::MusicStatusChanged {
        meditation_id,
        external_task_id: external_task_id.to_string(),
        status: MusicStatus::Complete.as_str().to_string(),
        timestamp: Utc::now(),
    });
    Ok(WebhookOutcome::Claimed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: serde_json::Value) -> MusicCallback {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn test_final_callback_with_camel_case_fields() {
        let callback = parse(json!({
            "code": 200,
            "msg": "All generated successfully.",
            "data": {
                "callbackType": "complete",
                "taskId": "ext-1",
                "data": [
                    {"id": "a", "audioUrl": "https://cdn/a.mp3", "duration": 120.5},
                    {"id": "b", "audio_url": "https://cdn/b.mp3", "duration": 163.8}
                ]
            }
        }));

        assert_eq!(callback.external_task_id(), Some("ext-1"));
        assert!(callback.is_final_with_audio());
        let tracks = callback.tracks();
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[1].audio_url.as_deref(), Some("https://cdn/b.mp3"));
    }

    #[test]
    fn test_intermediate_phase_is_not_final() {
        let callback = parse(json!({
            "code": 200,
            "data": {
                "callbackType": "first",
                "task_id": "ext-1",
                "data": [{"id": "a", "audio_url": "https://cdn/a.mp3", "duration": 60.0}]
            }
        }));
        assert!(!callback.is_final_with_audio());
    }

    #[test]
    fn test_final_phase_without_audio_is_not_final() {
        let callback = parse(json!({
            "code": 200,
            "data": {
                "callbackType": "complete",
                "task_id": "ext-1",
                "data": [{"id": "a", "audio_url": "", "duration": 60.0}]
            }
        }));
        assert!(!callback.is_final_with_audio());
    }

    #[test]
    fn test_missing_task_id() {
        let callback = parse(json!({"code": 500, "msg": "boom"}));
        assert_eq!(callback.external_task_id(), None);
        assert!(callback.tracks().is_empty());
    }
}
