//! Completion reconciler
//!
//! Two triggers observe the external music task: the self-rescheduling
//! poller (`poller`) and the pushed callback (`webhook`). Both funnel into
//! [`claim_completion`], taken under the per-external-task lock (`lock`), so
//! exactly one of them schedules the music store step.

pub mod lock;
pub mod poller;
pub mod webhook;

pub use lock::{with_lock, ReconcileLock};
pub use webhook::{handle_callback, MusicCallback, WebhookOutcome};

use sqlx::SqlitePool;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::db::meditations;
use crate::models::{CompletionPath, StageTask};
use crate::queue::{self, Backoff, CONVERSION_BACKOFF};
use crate::stages::StageError;

/// How long a request whose conversion gave up waits for the callback
pub const DEFAULT_CALLBACK_GRACE: Duration = Duration::from_secs(30 * 60);

/// Bounded wait for a lossless conversion to produce a download URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionPolling {
    pub max_tries: u32,
    /// Sleep before check `n` (1-based)
    pub backoff: Backoff,
    /// Delay before the final check once the conversion gave up
    pub callback_grace: Duration,
}

impl Default for ConversionPolling {
    fn default() -> Self {
        Self {
            max_tries: 10,
            backoff: CONVERSION_BACKOFF,
            callback_grace: DEFAULT_CALLBACK_GRACE,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Timed out waiting for reconcile lock {0}")]
    LockTimeout(String),

    #[error("Invalid reconcile input: {0}")]
    Invalid(String),

    #[error(transparent)]
    Common(#[from] meditone_common::Error),
}

impl From<sqlx::Error> for ReconcileError {
    fn from(err: sqlx::Error) -> Self {
        ReconcileError::Common(err.into())
    }
}

impl From<ReconcileError> for StageError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::Invalid(message) => StageError::Permanent(message),
            other => StageError::Transient(other.to_string()),
        }
    }
}

/// Take the "music complete" transition and enqueue the store step
///
/// Claim and enqueue commit together. Must run under the reconcile lock for
/// the request's external task id. Returns false when another path already
/// claimed, or the request left `MusicPending`.
pub async fn claim_completion(
    pool: &SqlitePool,
    meditation_id: Uuid,
    path: CompletionPath,
    store_task: &StageTask,
) -> Result<bool, ReconcileError> {
    if !matches!(store_task, StageTask::MusicStore { .. }) {
        return Err(ReconcileError::Invalid(format!(
            "completion must schedule music_store, got {}",
            store_task.stage()
        )));
    }

    let mut tx = pool.begin().await?;
    if !meditations::claim_music_completion(&mut *tx, meditation_id, path).await? {
        tx.rollback().await?;
        return Ok(false);
    }
    queue::enqueue(&mut *tx, store_task, Duration::ZERO).await?;
    tx.commit().await?;

    tracing::info!(
        meditation_id = %meditation_id,
        via = path.as_str(),
        "Music completion claimed"
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ArtifactLocation, MusicSource, NewMeditation, PipelineState};
    use crate::queue::TaskQueue;
    use meditone_common::db::init_memory_database;

    async fn music_pending() -> (SqlitePool, Uuid) {
        let pool = init_memory_database().await.unwrap();
        let id = Uuid::new_v4();
        let new = NewMeditation {
            first_name: "Ada".into(),
            email: "ada@example.com".into(),
            birth_date: "1990-04-12".into(),
            style: "calm".into(),
            goals: "rest".into(),
            challenges: "stress".into(),
        };
        meditations::insert(&pool, id, &new).await.unwrap();
        sqlx::query("UPDATE meditations SET state = ? WHERE id = ?")
            .bind(PipelineState::MusicPending.as_str())
            .bind(id.to_string())
            .execute(&pool)
            .await
            .unwrap();
        (pool, id)
    }

    fn store_task(id: Uuid) -> StageTask {
        StageTask::MusicStore {
            meditation_id: id,
            voice: ArtifactLocation::Url("https://example.com/v.wav".into()),
            music: MusicSource::Tracks(Vec::new()),
        }
    }

    #[tokio::test]
    async fn test_second_claim_enqueues_nothing() {
        let (pool, id) = music_pending().await;

        assert!(claim_completion(&pool, id, CompletionPath::Webhook, &store_task(id))
            .await
            .unwrap());
        assert!(!claim_completion(&pool, id, CompletionPath::Poller, &store_task(id))
            .await
            .unwrap());

        let tasks = TaskQueue::new(pool.clone()).tasks_for(id).await.unwrap();
        assert_eq!(tasks.len(), 1);

        let meditation = meditations::get(&pool, id).await.unwrap();
        assert_eq!(meditation.music_completed_via, Some(CompletionPath::Webhook));
    }

    #[tokio::test]
    async fn test_claim_rejects_other_stages() {
        let (pool, id) = music_pending().await;
        let err = claim_completion(
            &pool,
            id,
            CompletionPath::Poller,
            &StageTask::Script { meditation_id: id },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ReconcileError::Invalid(_)));
    }
}
