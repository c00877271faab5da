//! Per-external-task mutual exclusion
//!
//! Backed by the `reconcile_locks` table so it holds across worker processes
//! sharing one database. A lock past its expiry may be taken over, which
//! bounds how long a crashed holder can block the other path.

use meditone_common::time::now_millis;
use sqlx::SqlitePool;
use std::future::Future;
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::ReconcileError;
use crate::context::LockSettings;

pub fn lock_key(external_task_id: &str) -> String {
    format!("reconcile:{}", external_task_id)
}

/// A held lock; released explicitly, or in the background if dropped
pub struct ReconcileLock {
    pool: SqlitePool,
    key: String,
    owner: String,
    released: bool,
}

impl ReconcileLock {
    /// Acquire within `settings.wait`, retrying every `retry_interval`
    pub async fn acquire(
        pool: &SqlitePool,
        external_task_id: &str,
        settings: &LockSettings,
    ) -> Result<Self, ReconcileError> {
        let key = lock_key(external_task_id);
        let owner = Uuid::new_v4().to_string();
        let started = Instant::now();

        loop {
            let now = now_millis();
            let result = sqlx::query(
                r#"
                INSERT INTO reconcile_locks (lock_key, owner, expires_at)
                VALUES (?, ?, ?)
                ON CONFLICT(lock_key) DO UPDATE
                SET owner = excluded.owner, expires_at = excluded.expires_at
                WHERE reconcile_locks.expires_at <= ?
                "#,
            )
            .bind(&key)
            .bind(&owner)
            .bind(now + settings.ttl.as_millis() as i64)
            .bind(now)
            .execute(pool)
            .await?;

            if result.rows_affected() == 1 {
                debug!(lock = %key, "Reconcile lock acquired");
                return Ok(Self {
                    pool: pool.clone(),
                    key,
                    owner,
                    released: false,
                });
            }

            if started.elapsed() >= settings.wait {
                return Err(ReconcileError::LockTimeout(key));
            }
            tokio::time::sleep(settings.retry_interval).await;
        }
    }

    pub async fn release(mut self) {
        self.released = true;
        delete_lock(&self.pool, &self.key, &self.owner).await;
    }
}

impl Drop for ReconcileLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Cancelled or panicked holder
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let pool = self.pool.clone();
            let key = std::mem::take(&mut self.key);
            let owner = std::mem::take(&mut self.owner);
            handle.spawn(async move {
                delete_lock(&pool, &key, &owner).await;
            });
        }
    }
}

async fn delete_lock(pool: &SqlitePool, key: &str, owner: &str) {
    let result = sqlx::query("DELETE FROM reconcile_locks WHERE lock_key = ? AND owner = ?")
        .bind(key)
        .bind(owner)
        .execute(pool)
        .await;

    match result {
        Ok(_) => debug!(lock = %key, "Reconcile lock released"),
        Err(e) => warn!(lock = %key, error = %e, "Failed to release reconcile lock; it will expire"),
    }
}

/// Run `body` while holding the lock for `external_task_id`
///
/// The lock is released on every exit path of `body`.
pub async fn with_lock<T, E, F, Fut>(
    pool: &SqlitePool,
    external_task_id: &str,
    settings: &LockSettings,
    body: F,
) -> Result<T, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<ReconcileError>,
{
    let lock = ReconcileLock::acquire(pool, external_task_id, settings).await?;
    let result = body().await;
    lock.release().await;
    result
}
