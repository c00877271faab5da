//! meditone-pipeline library interface
//!
//! Exposes the pipeline, reconciler and mixer for the binary and for
//! integration tests.

pub mod api;
pub mod audio;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod models;
pub mod queue;
pub mod reconciler;
pub mod services;
pub mod stages;

pub use crate::context::{Collaborators, PipelineContext, PipelineSettings};
pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Pool, queue, collaborators and event bus shared with the workers
    pub ctx: Arc<PipelineContext>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self {
            ctx,
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::intake_routes())
        .merge(api::status_routes())
        .merge(api::webhook_routes())
        .merge(api::event_routes())
        .merge(api::health_routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
