//! HTTP API handlers for meditone-pipeline
//!
//! Intake and status for clients, the music callback for the generation
//! service, plus health and the SSE event stream.

pub mod events;
pub mod health;
pub mod intake;
pub mod status;
pub mod webhook;

pub use events::event_routes;
pub use health::health_routes;
pub use intake::intake_routes;
pub use status::status_routes;
pub use webhook::webhook_routes;
