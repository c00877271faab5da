//! Request status query

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{job_log, meditations};
use crate::models::PipelineState;
use crate::{ApiResult, AppState};

/// GET /api/meditations/{id}/status body
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct StatusResponse {
    pub ready: bool,
    pub artifact_url: Option<String>,
    /// `pending`, `complete` or `failed`
    pub status: String,
    pub error: Option<String>,
}

pub async fn meditation_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<StatusResponse>> {
    let pool = &state.ctx.pool;
    let meditation = meditations::get(pool, id).await?;

    let response = match meditation.state {
        PipelineState::Complete => StatusResponse {
            ready: true,
            artifact_url: meditation.meditation_url,
            status: "complete".to_string(),
            error: None,
        },
        PipelineState::Failed => StatusResponse {
            ready: false,
            artifact_url: None,
            status: "failed".to_string(),
            error: job_log::latest_error(pool, id).await?,
        },
        _ => StatusResponse {
            ready: false,
            artifact_url: None,
            status: "pending".to_string(),
            error: None,
        },
    };

    Ok(Json(response))
}

pub fn status_routes() -> Router<AppState> {
    Router::new().route("/api/meditations/:id/status", get(meditation_status))
}
