//! Database initialization
//!
//! One SQLite file holds the meditation records, the durable stage queue,
//! the job log and the reconciliation locks. Keeping them together lets a
//! stage persist its artifact and enqueue its successor in one transaction.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Open (creating if needed) the database file and apply the schema
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    // WAL allows concurrent readers while a worker writes
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    create_schema(&pool).await?;

    Ok(pool)
}

/// Single-connection in-memory database with the full schema
///
/// The pool never recycles its connection, so the database lives as long
/// as the pool.
pub async fn init_memory_database() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;

    create_schema(&pool).await?;
    Ok(pool)
}

/// Create all tables (idempotent)
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_meditations_table(pool).await?;
    create_stage_tasks_table(pool).await?;
    create_job_logs_table(pool).await?;
    create_reconcile_locks_table(pool).await?;
    Ok(())
}

async fn create_meditations_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS meditations (
            id TEXT PRIMARY KEY,
            first_name TEXT NOT NULL,
            email TEXT NOT NULL,
            birth_date TEXT,
            style TEXT,
            goals TEXT,
            challenges TEXT,
            script_text TEXT,
            voice_url TEXT,
            music_url TEXT,
            music_task_id TEXT,
            music_status TEXT NOT NULL DEFAULT 'pending',
            music_completed_via TEXT,
            meditation_url TEXT,
            state TEXT NOT NULL DEFAULT 'created',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_meditations_music_task ON meditations(music_task_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_stage_tasks_table(pool: &SqlitePool) -> Result<()> {
    // available_at / lease_until are Unix milliseconds
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stage_tasks (
            id TEXT PRIMARY KEY,
            meditation_id TEXT NOT NULL,
            stage TEXT NOT NULL,
            payload TEXT NOT NULL,
            attempt INTEGER NOT NULL DEFAULT 1,
            status TEXT NOT NULL DEFAULT 'queued',
            available_at INTEGER NOT NULL,
            lease_until INTEGER,
            last_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_stage_tasks_ready ON stage_tasks(status, available_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_job_logs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            stage TEXT NOT NULL,
            task_id TEXT,
            meditation_id TEXT,
            level TEXT NOT NULL,
            message TEXT NOT NULL,
            context TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_job_logs_meditation ON job_logs(meditation_id, level)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_reconcile_locks_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS reconcile_locks (
            lock_key TEXT PRIMARY KEY,
            owner TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
