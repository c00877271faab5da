//! # Meditone Common Library
//!
//! Shared code for the meditone pipeline service:
//! - Database initialization and schema
//! - Pipeline event types and the EventBus
//! - SSE bridge for the EventBus
//! - Bootstrap configuration loading
//! - Timestamp helpers

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod sse;
pub mod time;

pub use error::{Error, Result};
