//! Voice stage: script text → header-complete voice file
//!
//! The voice file stays on local disk as a hand-off for the music and mix
//! stages; a copy goes to storage for the request record.

use std::path::Path;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use super::{
    commit_and_enqueue, load_in_state, remove_temp_file, write_temp_file, StageError,
    StageOutcome,
};
use crate::audio::normalize_voice_payload;
use crate::context::PipelineContext;
use crate::db::meditations::ArtifactField;
use crate::models::{PipelineState, StageTask};
use meditone_common::time::date_tag;

pub async fn run(
    ctx: &PipelineContext,
    meditation_id: Uuid,
    script: &str,
) -> Result<StageOutcome, StageError> {
    let meditation = match load_in_state(ctx, meditation_id, PipelineState::VoicePending).await? {
        Ok(meditation) => meditation,
        Err(noop) => return Ok(noop),
    };

    let raw = ctx.collaborators.voice.synthesize(script).await?;
    if raw.is_empty() {
        return Err(StageError::Permanent(
            "Voice synthesis returned an empty payload".to_string(),
        ));
    }
    let raw_len = raw.len();

    let (audio, container) = normalize_voice_payload(raw, &ctx.settings.voice_format)
        .map_err(|e| StageError::Permanent(format!("Could not build voice container: {}", e)))?;

    let voice_path = write_temp_file(ctx, "voice", container.extension(), &audio).await?;
    let name = format!(
        "meditation_voice_{}_{}.{}",
        meditation_id,
        date_tag(&meditation.created_at),
        container.extension()
    );

    let result = upload_and_hand_off(ctx, meditation_id, &voice_path, &name, container.mime_type())
        .await;

    match result {
        Ok(true) => {
            info!(
                meditation_id = %meditation_id,
                raw_bytes = raw_len,
                voice_path = %voice_path.display(),
                "Voice generated and stored"
            );
            Ok(StageOutcome::Completed)
        }
        Ok(false) => {
            remove_temp_file(&voice_path).await;
            Ok(StageOutcome::NoOp(
                "voice already stored by another delivery".to_string(),
            ))
        }
        Err(e) => {
            remove_temp_file(&voice_path).await;
            Err(e)
        }
    }
}

async fn upload_and_hand_off(
    ctx: &PipelineContext,
    meditation_id: Uuid,
    voice_path: &Path,
    name: &str,
    mime_type: &str,
) -> Result<bool, StageError> {
    let voice_url = ctx
        .collaborators
        .storage
        .upload(voice_path, name, mime_type)
        .await?;

    let next = StageTask::MusicKickoff {
        meditation_id,
        voice_path: voice_path.to_path_buf(),
    };
    commit_and_enqueue(
        ctx,
        meditation_id,
        ArtifactField::VoiceUrl,
        &voice_url,
        PipelineState::VoicePending,
        &next,
        Duration::ZERO,
    )
    .await
}
