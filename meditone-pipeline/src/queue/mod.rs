//! Durable stage task queue
//!
//! Tasks live in the `stage_tasks` table. A worker claims a task by leasing
//! it; a task whose lease runs out (crashed or hung worker) becomes
//! claimable again with its attempt counter incremented, which gives
//! at-least-once delivery.

pub mod policy;
pub mod worker;

pub use policy::{Backoff, RetryPolicy, StagePolicies, CONVERSION_BACKOFF, POLL_BACKOFF};
pub use worker::WorkerPool;

use chrono::Utc;
use meditone_common::time::now_millis;
use meditone_common::Result;
use sqlx::{Row, Sqlite, SqlitePool};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{Stage, StageTask, TaskEnvelope};

/// Extra lease time beyond the stage timeout before redelivery
const LEASE_GRACE: Duration = Duration::from_secs(30);

/// Claim attempts lost to concurrent workers before giving up this round
const CLAIM_RACE_RETRIES: usize = 3;

/// A task handed to a worker
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub envelope: TaskEnvelope,
    /// The previous lease expired without an acknowledgement
    pub redelivered: bool,
}

/// Queue bookkeeping row, for inspection
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedTaskInfo {
    pub id: Uuid,
    pub stage: Stage,
    pub status: String,
    pub attempt: u32,
    pub available_at: i64,
    pub last_error: Option<String>,
    pub task: StageTask,
}

/// Admit a task for execution at or after `now + delay`
///
/// Takes any executor so the enqueue can join the caller's transaction.
pub async fn enqueue<'e, E>(executor: E, task: &StageTask, delay: Duration) -> Result<Uuid>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let id = Uuid::new_v4();
    let payload = serde_json::to_string(task)?;
    let available_at = now_millis() + delay.as_millis() as i64;
    let now = Utc::now().to_rfc3339();

    sqlx::query(
        r#"
        INSERT INTO stage_tasks (
            id, meditation_id, stage, payload, attempt, status,
            available_at, created_at, updated_at
        ) VALUES (?, ?, ?, ?, 1, 'queued', ?, ?, ?)
        "#,
    )
    .bind(id.to_string())
    .bind(task.meditation_id().to_string())
    .bind(task.stage().as_str())
    .bind(payload)
    .bind(available_at)
    .bind(&now)
    .bind(&now)
    .execute(executor)
    .await?;

    debug!(
        task_id = %id,
        stage = %task.stage(),
        meditation_id = %task.meditation_id(),
        delay_ms = delay.as_millis() as u64,
        "Task enqueued"
    );

    Ok(id)
}

/// Handle on the task table
#[derive(Clone)]
pub struct TaskQueue {
    pool: SqlitePool,
}

impl TaskQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Enqueue outside any transaction
    pub async fn enqueue(&self, task: &StageTask, delay: Duration) -> Result<Uuid> {
        enqueue(&self.pool, task, delay).await
    }

    /// Lease the next runnable task
    ///
    /// Runnable means queued and due, or running with an expired lease.
    /// The lease length is the claimed stage's timeout plus a grace period.
    pub async fn claim_next(&self, policies: &StagePolicies) -> Result<Option<ClaimedTask>> {
        for _ in 0..CLAIM_RACE_RETRIES {
            let now = now_millis();

            let candidate = sqlx::query(
                r#"
                SELECT id, stage, status FROM stage_tasks
                WHERE (status = 'queued' AND available_at <= ?)
                   OR (status = 'running' AND lease_until <= ?)
                ORDER BY available_at, created_at
                LIMIT 1
                "#,
            )
            .bind(now)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

            let Some(candidate) = candidate else {
                return Ok(None);
            };

            let id: String = candidate.get("id");
            let stage: String = candidate.get("stage");
            let previous_status: String = candidate.get("status");
            let redelivered = previous_status == "running";

            let lease = match stage.parse::<Stage>() {
                Ok(stage) => policies.get(stage).timeout + LEASE_GRACE,
                Err(_) => policies.max_timeout() + LEASE_GRACE,
            };

            let claimed = sqlx::query(
                r#"
                UPDATE stage_tasks
                SET status = 'running',
                    lease_until = ?,
                    attempt = attempt + CASE WHEN status = 'running' THEN 1 ELSE 0 END,
                    updated_at = ?
                WHERE id = ?
                  AND ((status = 'queued' AND available_at <= ?)
                    OR (status = 'running' AND lease_until <= ?))
                RETURNING payload, attempt
                "#,
            )
            .bind(now + lease.as_millis() as i64)
            .bind(Utc::now().to_rfc3339())
            .bind(&id)
            .bind(now)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

            // Another worker took it between the select and the update
            let Some(claimed) = claimed else {
                continue;
            };

            let task_id = match Uuid::parse_str(&id) {
                Ok(task_id) => task_id,
                Err(e) => {
                    warn!(task_id = %id, "Dropping task with malformed id: {}", e);
                    self.mark_failed_raw(&id, "malformed task id").await?;
                    continue;
                }
            };

            let payload: String = claimed.get("payload");
            let attempt: i64 = claimed.get("attempt");

            let task = match serde_json::from_str::<StageTask>(&payload) {
                Ok(task) => task,
                Err(e) => {
                    warn!(task_id = %task_id, "Dropping undecodable task payload: {}", e);
                    self.mark_failed(task_id, &format!("undecodable payload: {}", e))
                        .await?;
                    continue;
                }
            };

            if redelivered {
                warn!(
                    task_id = %task_id,
                    stage = %task.stage(),
                    attempt,
                    "Lease expired, redelivering task"
                );
            }

            return Ok(Some(ClaimedTask {
                envelope: TaskEnvelope {
                    id: task_id,
                    attempt: attempt.max(1) as u32,
                    task,
                },
                redelivered,
            }));
        }

        Ok(None)
    }

    /// Acknowledge successful handling
    pub async fn ack(&self, task_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE stage_tasks SET status = 'done', lease_until = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Put the task back with a new attempt number after `delay`
    pub async fn retry(
        &self,
        task_id: Uuid,
        next_attempt: u32,
        delay: Duration,
        error: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE stage_tasks
            SET status = 'queued', attempt = ?, available_at = ?, lease_until = NULL,
                last_error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(i64::from(next_attempt))
        .bind(now_millis() + delay.as_millis() as i64)
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark the task terminal-failed
    pub async fn mark_failed(&self, task_id: Uuid, error: &str) -> Result<()> {
        self.mark_failed_raw(&task_id.to_string(), error).await
    }

    async fn mark_failed_raw(&self, task_id: &str, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE stage_tasks
            SET status = 'failed', lease_until = NULL, last_error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Every task row for one request, in enqueue order
    pub async fn tasks_for(&self, meditation_id: Uuid) -> Result<Vec<QueuedTaskInfo>> {
        let rows = sqlx::query(
            r#"
            SELECT id, stage, status, attempt, available_at, last_error, payload
            FROM stage_tasks
            WHERE meditation_id = ?
            ORDER BY created_at, rowid
            "#,
        )
        .bind(meditation_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<QueuedTaskInfo> {
                let id: String = row.get("id");
                let stage: String = row.get("stage");
                let payload: String = row.get("payload");
                let attempt: i64 = row.get("attempt");
                Ok(QueuedTaskInfo {
                    id: Uuid::parse_str(&id).map_err(|e| {
                        meditone_common::Error::Internal(format!("Invalid task id {}: {}", id, e))
                    })?,
                    stage: stage.parse()?,
                    status: row.get("status"),
                    attempt: attempt.max(0) as u32,
                    available_at: row.get("available_at"),
                    last_error: row.get("last_error"),
                    task: serde_json::from_str(&payload)?,
                })
            })
            .collect()
    }
}
