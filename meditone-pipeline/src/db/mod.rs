//! Database access for meditone-pipeline
//!
//! Schema creation lives in `meditone_common::db`; this module holds the
//! queries. Functions that take a generic executor run equally against the
//! pool or inside a stage's transaction.

pub mod job_log;
pub mod meditations;
