//! Job log: persisted audit trail of stage activity and failures
//!
//! The status endpoint reads the most recent error entry as a request's
//! diagnostic, so every terminal failure must land here.

use chrono::Utc;
use meditone_common::Result;
use serde::Serialize;
use sqlx::{Row, Sqlite, SqlitePool};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

/// One job log entry to write
#[derive(Debug, Clone)]
pub struct JobLogEntry<'a> {
    /// Stage name, or the subsystem (`webhook`) that produced the entry
    pub stage: &'a str,
    pub task_id: Option<Uuid>,
    pub meditation_id: Option<Uuid>,
    pub level: LogLevel,
    pub message: &'a str,
    pub context: serde_json::Value,
}

impl<'a> JobLogEntry<'a> {
    pub fn new(stage: &'a str, level: LogLevel, message: &'a str) -> Self {
        Self {
            stage,
            task_id: None,
            meditation_id: None,
            level,
            message,
            context: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn meditation(mut self, meditation_id: Uuid) -> Self {
        self.meditation_id = Some(meditation_id);
        self
    }

    pub fn task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

/// A stored job log row
#[derive(Debug, Clone, Serialize)]
pub struct JobLogRecord {
    pub stage: String,
    pub task_id: Option<String>,
    pub level: String,
    pub message: String,
    pub context: serde_json::Value,
    pub created_at: String,
}

/// Append an entry
pub async fn record<'e, E>(executor: E, entry: &JobLogEntry<'_>) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let context = serde_json::to_string(&entry.context)?;

    sqlx::query(
        r#"
        INSERT INTO job_logs (stage, task_id, meditation_id, level, message, context, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(entry.stage)
    .bind(entry.task_id.map(|id| id.to_string()))
    .bind(entry.meditation_id.map(|id| id.to_string()))
    .bind(entry.level.as_str())
    .bind(entry.message)
    .bind(context)
    .bind(Utc::now().to_rfc3339())
    .execute(executor)
    .await?;

    Ok(())
}

/// Most recent error message recorded for a request
pub async fn latest_error(pool: &SqlitePool, meditation_id: Uuid) -> Result<Option<String>> {
    let message = sqlx::query_scalar::<_, String>(
        r#"
        SELECT message FROM job_logs
        WHERE meditation_id = ? AND level = 'error'
        ORDER BY id DESC
        LIMIT 1
        "#,
    )
    .bind(meditation_id.to_string())
    .fetch_optional(pool)
    .await?;

    Ok(message)
}

/// All entries for a request, oldest first
pub async fn entries_for(pool: &SqlitePool, meditation_id: Uuid) -> Result<Vec<JobLogRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT stage, task_id, level, message, context, created_at
        FROM job_logs
        WHERE meditation_id = ?
        ORDER BY id
        "#,
    )
    .bind(meditation_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| -> Result<JobLogRecord> {
            let context: String = row.get("context");
            Ok(JobLogRecord {
                stage: row.get("stage"),
                task_id: row.get("task_id"),
                level: row.get("level"),
                message: row.get("message"),
                context: serde_json::from_str(&context)?,
                created_at: row.get("created_at"),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use meditone_common::db::init_memory_database;
    use serde_json::json;

    #[tokio::test]
    async fn test_latest_error_picks_newest_error_entry() {
        let pool = init_memory_database().await.unwrap();
        let id = Uuid::new_v4();

        record(
            &pool,
            &JobLogEntry::new("voice", LogLevel::Error, "first failure").meditation(id),
        )
        .await
        .unwrap();
        record(
            &pool,
            &JobLogEntry::new("mix", LogLevel::Error, "second failure").meditation(id),
        )
        .await
        .unwrap();
        record(
            &pool,
            &JobLogEntry::new("mix", LogLevel::Info, "not an error").meditation(id),
        )
        .await
        .unwrap();

        assert_eq!(
            latest_error(&pool, id).await.unwrap().as_deref(),
            Some("second failure")
        );
        assert!(latest_error(&pool, Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_entries_keep_context() {
        let pool = init_memory_database().await.unwrap();
        let id = Uuid::new_v4();
        let task_id = Uuid::new_v4();

        record(
            &pool,
            &JobLogEntry::new("music_poll", LogLevel::Warning, "retry scheduled")
                .meditation(id)
                .task(task_id)
                .context(json!({"attempt": 2, "delay_secs": 30})),
        )
        .await
        .unwrap();

        let entries = entries_for(&pool, id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].level, "warning");
        assert_eq!(entries[0].task_id, Some(task_id.to_string()));
        assert_eq!(entries[0].context["delay_secs"], 30);
    }
}
