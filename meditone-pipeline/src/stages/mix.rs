//! Mix stage: voice + music → final meditation; terminal success

use meditone_common::events::PipelineEvent;
use meditone_common::time::date_tag;
use tracing::info;
use uuid::Uuid;

use super::{
    load_in_state, read_artifact, remove_temp_file, remove_temp_files, write_temp_file,
    StageError, StageOutcome,
};
use crate::context::PipelineContext;
use crate::db::meditations::{self, ArtifactField};
use crate::models::{mix_handoffs, ArtifactLocation, PipelineState};

pub async fn run(
    ctx: &PipelineContext,
    meditation_id: Uuid,
    voice: &ArtifactLocation,
    music: &ArtifactLocation,
) -> Result<StageOutcome, StageError> {
    let meditation = match load_in_state(ctx, meditation_id, PipelineState::MixPending).await? {
        Ok(meditation) => meditation,
        Err(noop) => {
            // Last consumer of the hand-off files either way
            remove_temp_files(mix_handoffs(voice, music)).await;
            return Ok(noop);
        }
    };

    let voice_bytes = read_artifact(ctx, voice).await?;
    let music_bytes = read_artifact(ctx, music).await?;

    let mixed = ctx
        .mixer
        .mix(&voice_bytes, &music_bytes, &ctx.settings.mix)
        .await?;
    let extension = mixed.format.extension();

    let output = write_temp_file(ctx, "meditation", extension, &mixed.bytes).await?;
    let name = format!(
        "meditation_{}_{}.{}",
        meditation_id,
        date_tag(&meditation.created_at),
        extension
    );

    let result = async {
        let url = ctx
            .collaborators
            .storage
            .upload(&output, &name, mixed.mime_type)
            .await?;
        let stored = meditations::store_artifact(
            &ctx.pool,
            meditation_id,
            ArtifactField::MeditationUrl,
            &url,
            PipelineState::MixPending,
            PipelineState::Complete,
        )
        .await?;
        Ok::<_, StageError>((stored, url))
    }
    .await;
    remove_temp_file(&output).await;

    let (stored, url) = result?;
    remove_temp_files(mix_handoffs(voice, music)).await;

    if !stored {
        return Ok(StageOutcome::NoOp(
            "meditation already stored by another delivery".to_string(),
        ));
    }

    info!(
        meditation_id = %meditation_id,
        total_seconds = mixed.total_seconds,
        url = %url,
        "Meditation mixed and stored"
    );
    ctx.event_bus.emit_lossy(PipelineEvent::MeditationCompleted {
        meditation_id,
        artifact_url: url,
        timestamp: chrono::Utc::now(),
    });
    Ok(StageOutcome::Completed)
}
