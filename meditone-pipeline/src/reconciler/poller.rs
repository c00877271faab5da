//! Active poller
//!
//! One `MusicPoll` task per status check. A check that finds the job still
//! running enqueues the next check with `poll_attempt + 1` and the capped
//! poll backoff; the chain ends on success, upstream failure, or the poll
//! limit.
//!
//! A lossless conversion that fails or never becomes ready does not fail
//! the request: the webhook may still deliver the tracks. The poller logs a
//! warning and schedules one final check after the callback grace period,
//! which fails the request only if nothing claimed the completion by then.

use chrono::Utc;
use meditone_common::events::PipelineEvent;
use serde_json::json;
use std::path::Path;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{claim_completion, with_lock, ReconcileError};
use crate::context::PipelineContext;
use crate::db::job_log::{self, JobLogEntry, LogLevel};
use crate::db::meditations;
use crate::models::{
    select_best_track, ArtifactLocation, CompletionPath, ConversionStatus, ExternalMusicState,
    Meditation, MusicSource, MusicStatus, PipelineState, Stage, StageTask,
};
use crate::queue;
use crate::stages::{remove_temp_file, write_temp_file, StageError, StageOutcome};

/// Music still open for a completion claim
fn awaiting_music(meditation: &Meditation) -> bool {
    meditation.state == PipelineState::MusicPending
        && matches!(
            meditation.music_status,
            MusicStatus::Pending | MusicStatus::InProgress
        )
}

/// Drop the voice hand-off unless a poller claim passed it downstream
pub(crate) async fn release_voice(meditation: Option<&Meditation>, voice_path: &Path) {
    let handed_off = meditation
        .map(|m| m.music_completed_via == Some(CompletionPath::Poller))
        .unwrap_or(false);
    if !handed_off {
        remove_temp_file(voice_path).await;
    }
}

pub async fn poll(
    ctx: &PipelineContext,
    meditation_id: Uuid,
    voice_path: &Path,
    external_task_id: &str,
    poll_attempt: u32,
    final_check: bool,
) -> Result<StageOutcome, StageError> {
    let meditation = meditations::load(&ctx.pool, meditation_id).await?;
    let meditation = match meditation {
        Some(m) if awaiting_music(&m) => m,
        other => {
            release_voice(other.as_ref(), voice_path).await;
            return Ok(StageOutcome::NoOp(
                "music completion already resolved".to_string(),
            ));
        }
    };

    if final_check {
        return Err(StageError::Permanent(format!(
            "Music for task {} never became downloadable and no callback completed it",
            external_task_id
        )));
    }

    let status = ctx
        .collaborators
        .music
        .poll_status(external_task_id)
        .await?;
    debug!(
        meditation_id = %meditation_id,
        external_task_id,
        poll_attempt,
        state = ?status.state,
        "Music status polled"
    );

    match &status.state {
        ExternalMusicState::Failed(reason) => Err(StageError::Permanent(format!(
            "Music generation failed upstream: {}",
            reason
        ))),
        ExternalMusicState::Succeeded => match select_best_track(&status.tracks) {
            Some(best) => {
                let track_id = best.id.clone();
                finish(
                    ctx,
                    meditation_id,
                    voice_path,
                    external_task_id,
                    poll_attempt,
                    &track_id,
                )
                .await
            }
            None => {
                warn!(
                    meditation_id = %meditation_id,
                    external_task_id,
                    "Music reported success without a playable track"
                );
                reschedule(ctx, meditation_id, voice_path, external_task_id, poll_attempt).await
            }
        },
        ExternalMusicState::Pending | ExternalMusicState::InProgress => {
            if status.state == ExternalMusicState::InProgress
                && meditation.music_status == MusicStatus::Pending
                && meditations::mark_music_in_progress(&ctx.pool, meditation_id).await?
            {
                ctx.event_bus.emit_lossy(PipelineEvent::MusicStatusChanged {
                    meditation_id,
                    external_task_id: external_task_id.to_string(),
                    status: MusicStatus::InProgress.as_str().to_string(),
                    timestamp: Utc::now(),
                });
            }
            reschedule(ctx, meditation_id, voice_path, external_task_id, poll_attempt).await
        }
    }
}

/// Enqueue the next status check, or give up at the poll limit
async fn reschedule(
    ctx: &PipelineContext,
    meditation_id: Uuid,
    voice_path: &Path,
    external_task_id: &str,
    poll_attempt: u32,
) -> Result<StageOutcome, StageError> {
    let limit = ctx.settings.policies.poll_limit;
    if poll_attempt >= limit {
        return Err(StageError::Permanent(format!(
            "Music generation not finished after {} status checks",
            limit
        )));
    }

    let delay = ctx.settings.policies.poll_backoff.delay(poll_attempt);
    let next = StageTask::MusicPoll {
        meditation_id,
        voice_path: voice_path.to_path_buf(),
        external_task_id: external_task_id.to_string(),
        poll_attempt: poll_attempt + 1,
        final_check: false,
    };
    queue::enqueue(&ctx.pool, &next, delay).await?;

    debug!(
        meditation_id = %meditation_id,
        next_attempt = poll_attempt + 1,
        delay_secs = delay.as_secs(),
        "Music not ready, next status check scheduled"
    );
    Ok(StageOutcome::Completed)
}

/// Result of waiting on a lossless conversion
enum Conversion {
    Ready(String),
    /// Failed upstream or never ready; carries the reason
    GaveUp(String),
}

/// Wait for the lossless conversion's download URL
async fn await_conversion(
    ctx: &PipelineContext,
    conversion_task_id: &str,
) -> Result<Conversion, StageError> {
    let polling = &ctx.settings.conversion;

    for try_number in 1..=polling.max_tries {
        tokio::time::sleep(polling.backoff.delay(try_number)).await;

        match ctx
            .collaborators
            .music
            .poll_conversion_status(conversion_task_id)
            .await?
        {
            ConversionStatus::Ready { download_url } => {
                return Ok(Conversion::Ready(download_url))
            }
            ConversionStatus::Failed { status } => {
                return Ok(Conversion::GaveUp(format!(
                    "Lossless conversion {} failed: {}",
                    conversion_task_id, status
                )))
            }
            ConversionStatus::Pending { status } => {
                debug!(conversion_task_id, try_number, status, "Conversion not ready");
            }
        }
    }

    Ok(Conversion::GaveUp(format!(
        "Lossless conversion {} not ready after {} checks",
        conversion_task_id, polling.max_tries
    )))
}

/// Stop polling without failing; leave the request to the callback until
/// the final check comes due
async fn give_up_conversion(
    ctx: &PipelineContext,
    meditation_id: Uuid,
    voice_path: &Path,
    external_task_id: &str,
    poll_attempt: u32,
    reason: &str,
) -> Result<StageOutcome, StageError> {
    let grace = ctx.settings.conversion.callback_grace;
    let final_check = StageTask::MusicPoll {
        meditation_id,
        voice_path: voice_path.to_path_buf(),
        external_task_id: external_task_id.to_string(),
        poll_attempt,
        final_check: true,
    };

    let mut tx = ctx.pool.begin().await?;
    job_log::record(
        &mut *tx,
        &JobLogEntry::new(Stage::MusicPoll.as_str(), LogLevel::Warning, reason)
            .meditation(meditation_id)
            .context(json!({
                "external_task_id": external_task_id,
                "final_check_in_secs": grace.as_secs(),
            })),
    )
    .await?;
    queue::enqueue(&mut *tx, &final_check, grace).await?;
    tx.commit().await?;

    warn!(
        meditation_id = %meditation_id,
        external_task_id,
        final_check_in_secs = grace.as_secs(),
        reason,
        "Lossless conversion gave up; waiting for the music callback"
    );
    Ok(StageOutcome::Completed)
}

/// Convert, download and claim the completion for the poller path
async fn finish(
    ctx: &PipelineContext,
    meditation_id: Uuid,
    voice_path: &Path,
    external_task_id: &str,
    poll_attempt: u32,
    track_id: &str,
) -> Result<StageOutcome, StageError> {
    let conversion_task_id = ctx
        .collaborators
        .music
        .request_lossless_conversion(external_task_id, track_id)
        .await?;
    let download_url = match await_conversion(ctx, &conversion_task_id).await? {
        Conversion::Ready(url) => url,
        Conversion::GaveUp(reason) => {
            return give_up_conversion(
                ctx,
                meditation_id,
                voice_path,
                external_task_id,
                poll_attempt,
                &reason,
            )
            .await
        }
    };

    let bytes = ctx.collaborators.fetcher.fetch(&download_url).await?;
    if bytes.is_empty() {
        return Err(StageError::Transient(format!(
            "Converted music from {} downloaded empty",
            download_url
        )));
    }
    let music_path = write_temp_file(ctx, "music", "wav", &bytes).await?;

    let claimed = claim_under_lock(ctx, meditation_id, voice_path, external_task_id, &music_path)
        .await;

    match claimed {
        Ok(true) => {
            info!(
                meditation_id = %meditation_id,
                external_task_id,
                track_id,
                "Poller claimed music completion"
            );
            ctx.event_bus.emit_lossy(PipelineEvent::MusicStatusChanged {
                meditation_id,
                external_task_id: external_task_id.to_string(),
                status: MusicStatus::Complete.as_str().to_string(),
                timestamp: Utc::now(),
            });
            Ok(StageOutcome::Completed)
        }
        Ok(false) => {
            remove_temp_file(&music_path).await;
            let current = meditations::load(&ctx.pool, meditation_id).await?;
            release_voice(current.as_ref(), voice_path).await;
            Ok(StageOutcome::NoOp(
                "music completion claimed by another path".to_string(),
            ))
        }
        Err(e) => {
            remove_temp_file(&music_path).await;
            Err(e.into())
        }
    }
}

async fn claim_under_lock(
    ctx: &PipelineContext,
    meditation_id: Uuid,
    voice_path: &Path,
    external_task_id: &str,
    music_path: &Path,
) -> Result<bool, ReconcileError> {
    let store = StageTask::MusicStore {
        meditation_id,
        voice: ArtifactLocation::LocalPath(voice_path.to_path_buf()),
        music: MusicSource::LocalFile(music_path.to_path_buf()),
    };

    with_lock(
        &ctx.pool,
        external_task_id,
        &ctx.settings.lock,
        || async {
            claim_completion(&ctx.pool, meditation_id, CompletionPath::Poller, &store).await
        },
    )
    .await
}
