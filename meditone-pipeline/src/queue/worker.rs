//! Worker pool
//!
//! Each worker loops: lease a task, run its handler under the stage timeout,
//! then acknowledge, reschedule with backoff, or fail the request. All
//! inter-stage state travels through the queue and the request record, so
//! workers share nothing but the context.

use chrono::Utc;
use meditone_common::events::PipelineEvent;
use meditone_common::Result;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::ClaimedTask;
use crate::context::PipelineContext;
use crate::db::job_log::{self, JobLogEntry, LogLevel};
use crate::db::meditations::{self, FailGuard};
use crate::models::{Stage, StageTask, TaskEnvelope};
use crate::reconciler::poller::release_voice;
use crate::stages::{self, remove_temp_files, StageError, StageOutcome};

const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct WorkerPool {
    ctx: Arc<PipelineContext>,
    workers: usize,
    idle_interval: Duration,
}

impl WorkerPool {
    pub fn new(ctx: Arc<PipelineContext>, workers: usize) -> Self {
        Self {
            ctx,
            workers: workers.max(1),
            idle_interval: DEFAULT_IDLE_INTERVAL,
        }
    }

    /// How long an idle worker waits before looking for due tasks again
    pub fn with_idle_interval(mut self, idle_interval: Duration) -> Self {
        self.idle_interval = idle_interval;
        self
    }

    /// Start the workers; they stop when `cancel` fires
    pub fn spawn(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.workers)
            .map(|worker_id| {
                let pool = self.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    info!(worker_id, "Worker started");
                    pool.worker_loop(worker_id, cancel).await;
                    info!(worker_id, "Worker stopped");
                })
            })
            .collect()
    }

    async fn worker_loop(&self, worker_id: usize, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            let wait = match self.run_once().await {
                Ok(true) => continue,
                Ok(false) => self.idle_interval,
                Err(e) => {
                    error!(worker_id, error = %e, "Worker iteration failed");
                    self.idle_interval * 4
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Claim and process at most one task; false when nothing was due
    pub async fn run_once(&self) -> Result<bool> {
        match self.ctx.queue.claim_next(&self.ctx.settings.policies).await? {
            Some(claimed) => {
                process(&self.ctx, claimed).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Process due tasks until none remain or `max_tasks` ran
    pub async fn run_until_idle(&self, max_tasks: usize) -> Result<usize> {
        let mut processed = 0;
        while processed < max_tasks && self.run_once().await? {
            processed += 1;
        }
        Ok(processed)
    }
}

async fn process(ctx: &PipelineContext, claimed: ClaimedTask) -> Result<()> {
    let envelope = claimed.envelope;
    let stage = envelope.task.stage();
    let meditation_id = envelope.task.meditation_id();
    let policy = ctx.settings.policies.get(stage);

    if envelope.attempt > policy.max_attempts {
        let error = StageError::Permanent(format!(
            "{} exhausted {} attempts (redelivered after lease expiry)",
            stage, policy.max_attempts
        ));
        return fail_terminally(ctx, &envelope, &error).await;
    }

    debug!(
        task_id = %envelope.id,
        meditation_id = %meditation_id,
        stage = %stage,
        attempt = envelope.attempt,
        redelivered = claimed.redelivered,
        "Stage task started"
    );
    ctx.event_bus.emit_lossy(PipelineEvent::StageStarted {
        meditation_id,
        stage: stage.as_str().to_string(),
        attempt: envelope.attempt,
        timestamp: Utc::now(),
    });

    let outcome = match tokio::time::timeout(policy.timeout, stages::execute(ctx, &envelope)).await
    {
        Ok(outcome) => outcome,
        Err(_) => Err(StageError::Transient(format!(
            "{} timed out after {}s",
            stage,
            policy.timeout.as_secs()
        ))),
    };

    match outcome {
        Ok(StageOutcome::Completed) => {
            ctx.queue.ack(envelope.id).await?;
            let message = format!("{} completed", stage);
            job_log::record(
                &ctx.pool,
                &JobLogEntry::new(stage.as_str(), LogLevel::Info, &message)
                    .meditation(meditation_id)
                    .task(envelope.id)
                    .context(json!({ "attempt": envelope.attempt })),
            )
            .await?;
            info!(
                task_id = %envelope.id,
                meditation_id = %meditation_id,
                stage = %stage,
                attempt = envelope.attempt,
                "Stage task completed"
            );
            ctx.event_bus.emit_lossy(PipelineEvent::StageCompleted {
                meditation_id,
                stage: stage.as_str().to_string(),
                timestamp: Utc::now(),
            });
        }
        Ok(StageOutcome::NoOp(reason)) => {
            ctx.queue.ack(envelope.id).await?;
            info!(
                task_id = %envelope.id,
                meditation_id = %meditation_id,
                stage = %stage,
                reason = %reason,
                "Stage task skipped"
            );
        }
        Err(error) if error.is_transient() && envelope.attempt < policy.max_attempts => {
            let delay = policy.backoff.delay(envelope.attempt);
            let next_attempt = envelope.attempt + 1;
            ctx.queue
                .retry(envelope.id, next_attempt, delay, error.message())
                .await?;
            job_log::record(
                &ctx.pool,
                &JobLogEntry::new(stage.as_str(), LogLevel::Warning, error.message())
                    .meditation(meditation_id)
                    .task(envelope.id)
                    .context(json!({
                        "attempt": envelope.attempt,
                        "retry_in_secs": delay.as_secs(),
                    })),
            )
            .await?;
            warn!(
                task_id = %envelope.id,
                meditation_id = %meditation_id,
                stage = %stage,
                attempt = envelope.attempt,
                delay_secs = delay.as_secs(),
                error = %error,
                "Stage task failed, retry scheduled"
            );
            ctx.event_bus.emit_lossy(PipelineEvent::RetryScheduled {
                meditation_id,
                stage: stage.as_str().to_string(),
                attempt: next_attempt,
                delay_secs: delay.as_secs(),
                message: error.message().to_string(),
                timestamp: Utc::now(),
            });
        }
        Err(error) => fail_terminally(ctx, &envelope, &error).await?,
    }

    Ok(())
}

/// Record the failure, fail the request if its stage still owns it, and
/// close the task
async fn fail_terminally(
    ctx: &PipelineContext,
    envelope: &TaskEnvelope,
    error: &StageError,
) -> Result<()> {
    let stage = envelope.task.stage();
    let meditation_id = envelope.task.meditation_id();
    let guard = FailGuard {
        from: stage.owning_state(),
        fail_music: stage.fails_music(),
        require_music_unclaimed: stage == Stage::MusicPoll,
    };

    let mut tx = ctx.pool.begin().await?;
    let failed = meditations::fail(&mut *tx, meditation_id, guard).await?;
    job_log::record(
        &mut *tx,
        &JobLogEntry::new(stage.as_str(), LogLevel::Error, error.message())
            .meditation(meditation_id)
            .task(envelope.id)
            .context(json!({
                "attempt": envelope.attempt,
                "request_failed": failed,
            })),
    )
    .await?;
    tx.commit().await?;

    if failed {
        error!(
            task_id = %envelope.id,
            meditation_id = %meditation_id,
            stage = %stage,
            attempt = envelope.attempt,
            error = %error,
            "Stage failed terminally, meditation marked failed"
        );
        remove_temp_files(envelope.task.handoff_paths()).await;
        ctx.event_bus.emit_lossy(PipelineEvent::StageFailed {
            meditation_id,
            stage: stage.as_str().to_string(),
            message: error.message().to_string(),
            timestamp: Utc::now(),
        });
    } else {
        warn!(
            task_id = %envelope.id,
            meditation_id = %meditation_id,
            stage = %stage,
            error = %error,
            "Stale stage task failed; meditation already moved on"
        );
        if let StageTask::MusicPoll { voice_path, .. } = &envelope.task {
            let current = meditations::load(&ctx.pool, meditation_id).await?;
            release_voice(current.as_ref(), voice_path).await;
        }
    }

    ctx.queue.mark_failed(envelope.id, error.message()).await
}
