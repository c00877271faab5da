//! Music stages
//!
//! Kickoff starts the external job and hands control to the reconciler.
//! Store runs once per request, after a reconciler path claimed the
//! completion: it persists the chosen music and schedules the mix.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use super::{
    commit_and_enqueue, load_in_state, remove_temp_file, write_temp_file, StageError,
    StageOutcome,
};
use crate::context::PipelineContext;
use crate::db::meditations::{self, ArtifactField};
use crate::models::{
    select_best_track, ArtifactLocation, MusicJobRequest, MusicSource, PipelineState, StageTask,
};
use crate::queue;
use meditone_common::time::date_tag;

pub async fn kickoff(
    ctx: &PipelineContext,
    meditation_id: Uuid,
    voice_path: &Path,
) -> Result<StageOutcome, StageError> {
    let meditation = match load_in_state(ctx, meditation_id, PipelineState::MusicPending).await? {
        Ok(meditation) => meditation,
        Err(noop) => return Ok(noop),
    };
    if let Some(existing) = meditation.music_task_id.as_deref() {
        return Ok(StageOutcome::NoOp(format!(
            "music task {} already started",
            existing
        )));
    }

    let request = MusicJobRequest {
        style: meditation.style.clone().unwrap_or_default(),
        title: format!("Meditation Music for {}", meditation_id),
    };
    let external_task_id = ctx.collaborators.music.start_job(&request).await?;
    if external_task_id.trim().is_empty() {
        return Err(StageError::Permanent(
            "Music generation returned no task id".to_string(),
        ));
    }

    let first_poll = StageTask::MusicPoll {
        meditation_id,
        voice_path: voice_path.to_path_buf(),
        external_task_id: external_task_id.clone(),
        poll_attempt: 1,
        final_check: false,
    };
    let delay = ctx.settings.policies.poll_backoff.delay(1);

    let mut tx = ctx.pool.begin().await?;
    if !meditations::record_music_task(&mut *tx, meditation_id, &external_task_id).await? {
        tx.rollback().await?;
        return Ok(StageOutcome::NoOp(
            "music task recorded by another delivery".to_string(),
        ));
    }
    queue::enqueue(&mut *tx, &first_poll, delay).await?;
    tx.commit().await?;

    info!(
        meditation_id = %meditation_id,
        external_task_id = %external_task_id,
        first_poll_secs = delay.as_secs(),
        "Music generation started"
    );
    Ok(StageOutcome::Completed)
}

/// Music artifact materialized locally for upload and mixing
struct LocalMusic {
    path: PathBuf,
    extension: &'static str,
    mime_type: &'static str,
    /// Downloaded by this task rather than handed off to it
    owned: bool,
}

async fn materialize(ctx: &PipelineContext, music: &MusicSource) -> Result<LocalMusic, StageError> {
    match music {
        MusicSource::LocalFile(path) => Ok(LocalMusic {
            path: path.clone(),
            extension: "wav",
            mime_type: "audio/wav",
            owned: false,
        }),
        MusicSource::Tracks(tracks) => {
            let best = select_best_track(tracks).ok_or_else(|| {
                StageError::Permanent("Music callback carried no playable track".to_string())
            })?;
            let url = best.audio_url.as_deref().unwrap_or_default();
            let bytes = ctx.collaborators.fetcher.fetch(url).await?;
            if bytes.is_empty() {
                return Err(StageError::Transient(format!(
                    "Music track {} downloaded empty",
                    best.id
                )));
            }
            let path = write_temp_file(ctx, "music", "mp3", &bytes).await?;
            Ok(LocalMusic {
                path,
                extension: "mp3",
                mime_type: "audio/mpeg",
                owned: true,
            })
        }
    }
}

pub async fn store(
    ctx: &PipelineContext,
    meditation_id: Uuid,
    voice: &ArtifactLocation,
    music: &MusicSource,
) -> Result<StageOutcome, StageError> {
    let meditation = match load_in_state(ctx, meditation_id, PipelineState::MusicPending).await? {
        Ok(meditation) => meditation,
        Err(noop) => return Ok(noop),
    };

    let local = materialize(ctx, music).await?;
    let name = format!(
        "meditation_music_{}_{}.{}",
        meditation_id,
        date_tag(&meditation.created_at),
        local.extension
    );

    let result: Result<bool, StageError> = async {
        let music_url = ctx
            .collaborators
            .storage
            .upload(&local.path, &name, local.mime_type)
            .await?;

        let next = StageTask::Mix {
            meditation_id,
            voice: voice.clone(),
            music: ArtifactLocation::LocalPath(local.path.clone()),
        };
        commit_and_enqueue(
            ctx,
            meditation_id,
            ArtifactField::MusicUrl,
            &music_url,
            PipelineState::MusicPending,
            &next,
            Duration::ZERO,
        )
        .await
    }
    .await;

    match result {
        Ok(true) => {
            info!(meditation_id = %meditation_id, "Music stored, mix scheduled");
            Ok(StageOutcome::Completed)
        }
        Ok(false) => {
            if local.owned {
                remove_temp_file(&local.path).await;
            }
            Ok(StageOutcome::NoOp(
                "music already stored by another delivery".to_string(),
            ))
        }
        Err(e) => {
            if local.owned {
                warn!(meditation_id = %meditation_id, "Discarding downloaded music after failure");
                remove_temp_file(&local.path).await;
            }
            Err(e)
        }
    }
}
