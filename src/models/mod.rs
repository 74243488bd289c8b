//! Core data models for the upload pipeline.
//!
//! Records map to SQLite rows via `sqlx::FromRow` and serialize as JSON via
//! `serde` for the HTTP boundary.

pub mod file;
pub mod smile;
pub mod token;
