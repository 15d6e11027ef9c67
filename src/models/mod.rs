//! Core data models for the versioned document store.
//!
//! These entities map to the `users`, `files` and `versions` tables via
//! `sqlx::FromRow` and serialize as JSON via `serde`.

pub mod file;
pub mod owner;
pub mod version;
