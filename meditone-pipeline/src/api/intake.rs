//! Intake endpoint
//!
//! Validates the meditation form, creates the request and queues the first
//! stage in one transaction.

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use chrono::{NaiveDate, Utc};
use meditone_common::events::PipelineEvent;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::db::meditations;
use crate::models::{NewMeditation, PipelineState, StageTask};
use crate::queue;
use crate::{ApiError, ApiResult, AppState};

const MAX_NAME_CHARS: usize = 255;
const MAX_TEXT_CHARS: usize = 1000;

/// POST /api/meditations body
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IntakeForm {
    pub first_name: String,
    pub email: String,
    /// `YYYY-MM-DD`
    pub birth_date: String,
    pub style: String,
    pub goals: String,
    pub challenges: String,
    pub consent: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IntakeResponse {
    pub id: Uuid,
}

impl IntakeForm {
    /// Every violated rule, one message each; trimmed form on success
    pub fn validate(&self) -> Result<NewMeditation, Vec<String>> {
        let mut errors = Vec::new();

        let first_name = self.first_name.trim();
        if first_name.is_empty() {
            errors.push("Please enter your first name.".to_string());
        } else if first_name.chars().count() > MAX_NAME_CHARS {
            errors.push(format!(
                "First name must be at most {} characters.",
                MAX_NAME_CHARS
            ));
        }

        let email = self.email.trim();
        if email.is_empty() {
            errors.push("Please enter your email address.".to_string());
        } else if email.chars().count() > MAX_NAME_CHARS || !looks_like_email(email) {
            errors.push("Please enter a valid email address.".to_string());
        }

        let birth_date = self.birth_date.trim();
        if birth_date.is_empty() {
            errors.push("Please enter your birth date.".to_string());
        } else if NaiveDate::parse_from_str(birth_date, "%Y-%m-%d").is_err() {
            errors.push("Birth date must be a valid YYYY-MM-DD date.".to_string());
        }

        let style = self.style.trim();
        if style.is_empty() {
            errors.push("Please enter your preferred meditation style.".to_string());
        } else if style.chars().count() > MAX_NAME_CHARS {
            errors.push(format!(
                "Style must be at most {} characters.",
                MAX_NAME_CHARS
            ));
        }

        let goals = self.goals.trim();
        if goals.is_empty() {
            errors.push("Please enter your goals.".to_string());
        } else if goals.chars().count() > MAX_TEXT_CHARS {
            errors.push(format!("Goals must be at most {} characters.", MAX_TEXT_CHARS));
        }

        let challenges = self.challenges.trim();
        if challenges.is_empty() {
            errors.push("Please enter your challenges.".to_string());
        } else if challenges.chars().count() > MAX_TEXT_CHARS {
            errors.push(format!(
                "Challenges must be at most {} characters.",
                MAX_TEXT_CHARS
            ));
        }

        if !self.consent {
            errors.push("You must accept the terms and conditions.".to_string());
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(NewMeditation {
            first_name: first_name.to_string(),
            email: email.to_string(),
            birth_date: birth_date.to_string(),
            style: style.to_string(),
            goals: goals.to_string(),
            challenges: challenges.to_string(),
        })
    }
}

/// One `@`, a non-empty local part, a dotted domain, no whitespace
fn looks_like_email(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain
                    .split_once('.')
                    .map(|(host, tld)| !host.is_empty() && !tld.is_empty() && !tld.ends_with('.'))
                    .unwrap_or(false)
        }
        None => false,
    }
}

/// POST /api/meditations
pub async fn submit_meditation(
    State(state): State<AppState>,
    Json(form): Json<IntakeForm>,
) -> ApiResult<(StatusCode, Json<IntakeResponse>)> {
    let new = form.validate().map_err(ApiError::Validation)?;
    let ctx = &state.ctx;
    let id = Uuid::new_v4();

    let mut tx = ctx.pool.begin().await.map_err(meditone_common::Error::from)?;
    meditations::insert(&mut *tx, id, &new).await?;
    queue::enqueue(
        &mut *tx,
        &StageTask::Script { meditation_id: id },
        Duration::ZERO,
    )
    .await?;
    if !meditations::advance(
        &mut *tx,
        id,
        PipelineState::Created,
        PipelineState::ScriptPending,
    )
    .await?
    {
        return Err(ApiError::Internal(format!(
            "meditation {} left the created state during intake",
            id
        )));
    }
    tx.commit().await.map_err(meditone_common::Error::from)?;

    info!(meditation_id = %id, "Meditation request accepted");
    ctx.event_bus.emit_lossy(PipelineEvent::MeditationSubmitted {
        meditation_id: id,
        timestamp: Utc::now(),
    });

    Ok((StatusCode::CREATED, Json(IntakeResponse { id })))
}

pub fn intake_routes() -> Router<AppState> {
    Router::new().route("/api/meditations", post(submit_meditation))
}
