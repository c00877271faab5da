//! Stage handlers
//!
//! Each handler checks that the request is still in the state its stage
//! owns, calls one collaborator, then persists its artifact, enqueues the
//! next stage and advances the request inside one transaction. A handler
//! that finds the request elsewhere (duplicate or stale delivery) returns
//! `StageOutcome::NoOp` without side effects.

pub mod mix;
pub mod music;
pub mod script;
pub mod voice;

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::audio::MixError;
use crate::context::PipelineContext;
use crate::db::meditations::{self, ArtifactField};
use crate::models::{ArtifactLocation, Meditation, PipelineState, StageTask, TaskEnvelope};
use crate::queue;
use crate::reconciler;
use crate::services::ServiceError;

/// Handler failure, classified for the retry decision
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StageError {
    /// Worth another attempt after backoff
    #[error("{0}")]
    Transient(String),
    /// Retrying cannot help; the request fails now
    #[error("{0}")]
    Permanent(String),
}

impl StageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StageError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            StageError::Transient(message) | StageError::Permanent(message) => message,
        }
    }
}

impl From<ServiceError> for StageError {
    fn from(err: ServiceError) -> Self {
        if err.is_transient() {
            StageError::Transient(err.to_string())
        } else {
            StageError::Permanent(err.to_string())
        }
    }
}

impl From<MixError> for StageError {
    fn from(err: MixError) -> Self {
        if err.is_transient() {
            StageError::Transient(err.to_string())
        } else {
            StageError::Permanent(err.to_string())
        }
    }
}

impl From<meditone_common::Error> for StageError {
    fn from(err: meditone_common::Error) -> Self {
        StageError::Transient(err.to_string())
    }
}

impl From<sqlx::Error> for StageError {
    fn from(err: sqlx::Error) -> Self {
        StageError::Transient(format!("Database error: {}", err))
    }
}

impl From<std::io::Error> for StageError {
    fn from(err: std::io::Error) -> Self {
        StageError::Transient(format!("IO error: {}", err))
    }
}

/// What a successful handler run did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// Artifact persisted and the next step scheduled
    Completed,
    /// Request was not in the owning state; nothing changed
    NoOp(String),
}

/// Dispatch a claimed task to its handler
pub async fn execute(
    ctx: &PipelineContext,
    envelope: &TaskEnvelope,
) -> Result<StageOutcome, StageError> {
    match &envelope.task {
        StageTask::Script { meditation_id } => script::run(ctx, *meditation_id).await,
        StageTask::Voice {
            meditation_id,
            script,
        } => voice::run(ctx, *meditation_id, script).await,
        StageTask::MusicKickoff {
            meditation_id,
            voice_path,
        } => music::kickoff(ctx, *meditation_id, voice_path).await,
        StageTask::MusicPoll {
            meditation_id,
            voice_path,
            external_task_id,
            poll_attempt,
            final_check,
        } => {
            reconciler::poller::poll(
                ctx,
                *meditation_id,
                voice_path,
                external_task_id,
                *poll_attempt,
                *final_check,
            )
            .await
        }
        StageTask::MusicStore {
            meditation_id,
            voice,
            music,
        } => music::store(ctx, *meditation_id, voice, music).await,
        StageTask::Mix {
            meditation_id,
            voice,
            music,
        } => mix::run(ctx, *meditation_id, voice, music).await,
    }
}

/// Load the request if it is in `expected`, otherwise explain why not
pub(crate) async fn load_in_state(
    ctx: &PipelineContext,
    id: Uuid,
    expected: PipelineState,
) -> Result<Result<Meditation, StageOutcome>, StageError> {
    match meditations::load(&ctx.pool, id).await? {
        None => Ok(Err(StageOutcome::NoOp(format!("meditation {} not found", id)))),
        Some(meditation) if meditation.state != expected => Ok(Err(StageOutcome::NoOp(format!(
            "meditation is {}, stage expects {}",
            meditation.state, expected
        )))),
        Some(meditation) => Ok(Ok(meditation)),
    }
}

/// Persist an artifact, enqueue `next` and enter the next pending state
///
/// `from` is the stage's owning `*Pending` state. Returns false when the
/// request already left it; nothing is written or enqueued then.
pub(crate) async fn commit_and_enqueue(
    ctx: &PipelineContext,
    id: Uuid,
    field: ArtifactField,
    value: &str,
    from: PipelineState,
    next: &StageTask,
    delay: Duration,
) -> Result<bool, StageError> {
    let done = from
        .successor()
        .ok_or_else(|| StageError::Permanent(format!("{} has no successor state", from)))?;
    let next_pending = done
        .successor()
        .ok_or_else(|| StageError::Permanent(format!("{} has no successor state", done)))?;

    let mut tx = ctx.pool.begin().await?;
    if !meditations::store_artifact(&mut *tx, id, field, value, from, done).await? {
        tx.rollback().await?;
        return Ok(false);
    }
    queue::enqueue(&mut *tx, next, delay).await?;
    meditations::advance(&mut *tx, id, done, next_pending).await?;
    tx.commit().await?;

    Ok(true)
}

/// Read an artifact from a hand-off file or a storage URL
pub(crate) async fn read_artifact(
    ctx: &PipelineContext,
    location: &ArtifactLocation,
) -> Result<Vec<u8>, StageError> {
    match location {
        ArtifactLocation::LocalPath(path) => match tokio::fs::read(path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StageError::Permanent(
                format!("Hand-off file missing: {}", path.display()),
            )),
            Err(e) => Err(e.into()),
        },
        ArtifactLocation::Url(url) => Ok(ctx.collaborators.fetcher.fetch(url).await?),
    }
}

/// Delete a temp file, tolerating one that is already gone
pub(crate) async fn remove_temp_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed temp file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove temp file"),
    }
}

/// Takes owned paths so the worker future spawned on tokio stays `Send`
pub(crate) async fn remove_temp_files(paths: Vec<PathBuf>) {
    for path in &paths {
        remove_temp_file(path).await;
    }
}

/// Write a fresh temp file under the context's temp directory
pub(crate) async fn write_temp_file(
    ctx: &PipelineContext,
    prefix: &str,
    extension: &str,
    bytes: &[u8],
) -> Result<PathBuf, StageError> {
    tokio::fs::create_dir_all(&ctx.settings.temp_dir).await?;
    let path = ctx.temp_path(prefix, extension);
    tokio::fs::write(&path, bytes).await?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_errors_classified() {
        let transient: StageError = ServiceError::Http {
            status: 503,
            body: "busy".into(),
        }
        .into();
        assert!(transient.is_transient());

        let permanent: StageError = ServiceError::Http {
            status: 400,
            body: "bad".into(),
        }
        .into();
        assert!(!permanent.is_transient());
        assert_eq!(permanent.message(), "HTTP 400: bad");
    }

    #[test]
    fn test_mix_errors_classified() {
        let err: StageError = MixError::DurationUndeterminable.into();
        assert!(!err.is_transient());

        let err: StageError = MixError::Timeout {
            tool: "ffmpeg".into(),
            secs: 180,
        }
        .into();
        assert!(err.is_transient());
    }
}
