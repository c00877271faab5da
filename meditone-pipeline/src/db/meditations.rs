//! Meditation request persistence
//!
//! Every state change is a compare-and-set on the `state` column, so a
//! redelivered or stale task that lost the race changes nothing.

use chrono::{DateTime, Utc};
use meditone_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::models::{CompletionPath, Meditation, MusicStatus, NewMeditation, PipelineState};

/// Artifact reference columns, one per producing stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactField {
    ScriptText,
    VoiceUrl,
    MusicUrl,
    MeditationUrl,
}

impl ArtifactField {
    fn column(&self) -> &'static str {
        match self {
            ArtifactField::ScriptText => "script_text",
            ArtifactField::VoiceUrl => "voice_url",
            ArtifactField::MusicUrl => "music_url",
            ArtifactField::MeditationUrl => "meditation_url",
        }
    }
}

/// Insert a new request in the `Created` state
pub async fn insert<'e, E>(executor: E, id: Uuid, new: &NewMeditation) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let now = Utc::now().to_rfc3339();

    sqlx::query(
        r#"
        INSERT INTO meditations (
            id, first_name, email, birth_date, style, goals, challenges,
            music_status, state, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', 'created', ?, ?)
        "#,
    )
    .bind(id.to_string())
    .bind(&new.first_name)
    .bind(&new.email)
    .bind(&new.birth_date)
    .bind(&new.style)
    .bind(&new.goals)
    .bind(&new.challenges)
    .bind(&now)
    .bind(&now)
    .execute(executor)
    .await?;

    Ok(())
}

/// Load a request by id
pub async fn load(pool: &SqlitePool, id: Uuid) -> Result<Option<Meditation>> {
    let row = sqlx::query("SELECT * FROM meditations WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(row_to_meditation).transpose()
}

/// Load a request by id, NotFound if absent
pub async fn get(pool: &SqlitePool, id: Uuid) -> Result<Meditation> {
    load(pool, id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Meditation {} not found", id)))
}

/// Find the request correlated with an external music task
pub async fn find_by_music_task(
    pool: &SqlitePool,
    external_task_id: &str,
) -> Result<Option<Meditation>> {
    let row = sqlx::query("SELECT * FROM meditations WHERE music_task_id = ? LIMIT 1")
        .bind(external_task_id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(row_to_meditation).transpose()
}

/// Move `from` → `to`; false when the request is no longer in `from`
pub async fn advance<'e, E>(
    executor: E,
    id: Uuid,
    from: PipelineState,
    to: PipelineState,
) -> Result<bool>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        "UPDATE meditations SET state = ?, updated_at = ? WHERE id = ? AND state = ?",
    )
    .bind(to.as_str())
    .bind(Utc::now().to_rfc3339())
    .bind(id.to_string())
    .bind(from.as_str())
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Persist a stage's artifact and move `from` → `to` in one statement
pub async fn store_artifact<'e, E>(
    executor: E,
    id: Uuid,
    field: ArtifactField,
    value: &str,
    from: PipelineState,
    to: PipelineState,
) -> Result<bool>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        "UPDATE meditations SET {} = ?, state = ?, updated_at = ? WHERE id = ? AND state = ?",
        field.column()
    );

    let result = sqlx::query(&sql)
        .bind(value)
        .bind(to.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .bind(from.as_str())
        .execute(executor)
        .await?;

    Ok(result.rows_affected() == 1)
}

/// Attach the external music task id (write-once per generation attempt)
pub async fn record_music_task<'e, E>(
    executor: E,
    id: Uuid,
    external_task_id: &str,
) -> Result<bool>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        UPDATE meditations
        SET music_task_id = ?, music_status = 'pending', updated_at = ?
        WHERE id = ? AND state = 'music_pending' AND music_task_id IS NULL
        "#,
    )
    .bind(external_task_id)
    .bind(Utc::now().to_rfc3339())
    .bind(id.to_string())
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Note an intermediate music phase; never downgrades complete or failed
pub async fn mark_music_in_progress<'e, E>(executor: E, id: Uuid) -> Result<bool>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        UPDATE meditations
        SET music_status = 'in_progress', updated_at = ?
        WHERE id = ? AND state = 'music_pending'
          AND music_status IN ('pending', 'in_progress')
        "#,
    )
    .bind(Utc::now().to_rfc3339())
    .bind(id.to_string())
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// The single guarded "music complete" transition
///
/// Returns true for exactly one caller per request.
pub async fn claim_music_completion<'e, E>(
    executor: E,
    id: Uuid,
    path: CompletionPath,
) -> Result<bool>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        UPDATE meditations
        SET music_status = 'complete', music_completed_via = ?, updated_at = ?
        WHERE id = ? AND state = 'music_pending'
          AND music_status IN ('pending', 'in_progress')
        "#,
    )
    .bind(path.as_str())
    .bind(Utc::now().to_rfc3339())
    .bind(id.to_string())
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Guards applied when failing a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailGuard {
    /// State the failing stage owns
    pub from: PipelineState,
    /// Also mark the external music task failed
    pub fail_music: bool,
    /// Refuse if the music completion was already claimed
    pub require_music_unclaimed: bool,
}

impl FailGuard {
    pub fn from_state(from: PipelineState) -> Self {
        Self {
            from,
            fail_music: false,
            require_music_unclaimed: false,
        }
    }
}

/// Move the request to `Failed`; false when the guard no longer holds
pub async fn fail<'e, E>(executor: E, id: Uuid, guard: FailGuard) -> Result<bool>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        UPDATE meditations
        SET state = 'failed',
            music_status = CASE WHEN ? THEN 'failed' ELSE music_status END,
            updated_at = ?
        WHERE id = ? AND state = ?
          AND (? = 0 OR music_status != 'complete')
        "#,
    )
    .bind(guard.fail_music)
    .bind(Utc::now().to_rfc3339())
    .bind(id.to_string())
    .bind(guard.from.as_str())
    .bind(guard.require_music_unclaimed)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Invalid timestamp {}: {}", raw, e)))
}

fn row_to_meditation(row: &SqliteRow) -> Result<Meditation> {
    let id: String = row.get("id");
    let id = Uuid::parse_str(&id)
        .map_err(|e| Error::Internal(format!("Invalid meditation id {}: {}", id, e)))?;
    let music_status: String = row.get("music_status");
    let state: String = row.get("state");
    let completed_via: Option<String> = row.get("music_completed_via");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(Meditation {
        id,
        first_name: row.get("first_name"),
        email: row.get("email"),
        birth_date: row.get("birth_date"),
        style: row.get("style"),
        goals: row.get("goals"),
        challenges: row.get("challenges"),
        script_text: row.get("script_text"),
        voice_url: row.get("voice_url"),
        music_url: row.get("music_url"),
        music_task_id: row.get("music_task_id"),
        music_status: music_status.parse::<MusicStatus>()?,
        music_completed_via: completed_via
            .as_deref()
            .map(str::parse::<CompletionPath>)
            .transpose()?,
        meditation_url: row.get("meditation_url"),
        state: state.parse::<PipelineState>()?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}
