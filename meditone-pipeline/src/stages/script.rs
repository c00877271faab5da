//! Script stage: intake fields → meditation script text

use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use super::{commit_and_enqueue, load_in_state, StageError, StageOutcome};
use crate::context::PipelineContext;
use crate::db::meditations::ArtifactField;
use crate::models::{Meditation, PipelineState, StageTask};
use crate::services::ServiceError;

/// Appended to the prompt for the single length-constrained retry
pub const LENGTH_CONSTRAINT: &str = " Keep the script under 160 words.";

pub fn build_prompt(meditation: &Meditation) -> String {
    format!(
        "You are a meditation expert. Create a personalized meditation script for {}. \
         Their goals are: {}. Their challenges are: {}. Use any influences from their star \
         sign using their date of birth: {}. The script should be calming, supportive, and \
         tailored to their needs. Make the meditation one minute long when spoken.",
        meditation.first_name,
        meditation.goals.as_deref().unwrap_or_default(),
        meditation.challenges.as_deref().unwrap_or_default(),
        meditation.birth_date.as_deref().unwrap_or_default(),
    )
}

/// Generate, retrying once with an explicit length constraint on truncation
async fn generate_script(ctx: &PipelineContext, prompt: &str) -> Result<String, StageError> {
    let writer = &ctx.collaborators.script_writer;

    match writer.generate(prompt).await {
        Ok(text) => Ok(text),
        Err(ServiceError::Truncated { partial }) => {
            warn!(
                partial_chars = partial.len(),
                "Script truncated at length limit, retrying with length constraint"
            );
            let constrained = format!("{}{}", prompt, LENGTH_CONSTRAINT);
            match writer.generate(&constrained).await {
                Ok(text) => Ok(text),
                Err(ServiceError::Truncated { .. }) => Err(StageError::Permanent(
                    "Script still truncated after length-constrained retry".to_string(),
                )),
                Err(e) => Err(e.into()),
            }
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn run(ctx: &PipelineContext, meditation_id: Uuid) -> Result<StageOutcome, StageError> {
    let meditation = match load_in_state(ctx, meditation_id, PipelineState::ScriptPending).await? {
        Ok(meditation) => meditation,
        Err(noop) => return Ok(noop),
    };

    let script = generate_script(ctx, &build_prompt(&meditation)).await?;
    let script = script.trim().to_string();
    if script.is_empty() {
        return Err(StageError::Permanent(
            "Script generation returned empty text".to_string(),
        ));
    }

    let next = StageTask::Voice {
        meditation_id,
        script: script.clone(),
    };
    let committed = commit_and_enqueue(
        ctx,
        meditation_id,
        ArtifactField::ScriptText,
        &script,
        PipelineState::ScriptPending,
        &next,
        Duration::ZERO,
    )
    .await?;

    if !committed {
        return Ok(StageOutcome::NoOp(
            "script already stored by another delivery".to_string(),
        ));
    }

    info!(
        meditation_id = %meditation_id,
        words = script.split_whitespace().count(),
        "Script generated"
    );
    Ok(StageOutcome::Completed)
}
