//! Music generation callback endpoint

use axum::{
    extract::{Query, State},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::reconciler::{handle_callback, MusicCallback, WebhookOutcome};
use crate::{ApiError, ApiResult, AppState};

#[derive(Debug, Default, Deserialize)]
pub struct WebhookQuery {
    pub token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub ok: bool,
    pub outcome: String,
}

/// A configured token must match exactly; without one every caller passes
fn token_matches(expected: Option<&str>, presented: Option<&str>) -> bool {
    match expected {
        Some(expected) => presented == Some(expected),
        None => true,
    }
}

/// POST /api/webhooks/music?token=...
pub async fn music_callback(
    State(state): State<AppState>,
    Query(query): Query<WebhookQuery>,
    Json(callback): Json<MusicCallback>,
) -> ApiResult<Json<WebhookResponse>> {
    let ctx = &state.ctx;
    if !token_matches(
        ctx.settings.webhook_token.as_deref(),
        query.token.as_deref(),
    ) {
        warn!("Music callback rejected: token mismatch");
        return Err(ApiError::Unauthorized);
    }

    debug!(
        code = callback.code,
        external_task_id = callback.external_task_id().unwrap_or("none"),
        phase = callback.phase().unwrap_or("none"),
        "Music callback received"
    );

    let outcome: WebhookOutcome = handle_callback(ctx, &callback).await?;
    Ok(Json(WebhookResponse {
        ok: true,
        outcome: outcome.as_str().to_string(),
    }))
}

pub fn webhook_routes() -> Router<AppState> {
    Router::new().route("/api/webhooks/music", post(music_callback))
}
