//! Versioned, content-addressed document store.
//!
//! Users upload named files; each upload under the same name becomes a new
//! immutable version with a gap-free version number. Versions are found by
//! name (latest or zero-based revision), by id, or by SHA-256 content hash,
//! always within the caller's own data.

use axum::Router;
use services::storage_service::StorageService;

pub mod config;
pub mod db;
pub mod errors;
pub mod fixtures;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;

/// Room for multipart framing and the `file_name` part on top of the upload limit.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Assemble the application router around a configured service.
pub fn app(service: StorageService) -> Router {
    let body_limit = usize::try_from(service.max_upload_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD);
    routes::routes::routes(body_limit).with_state(service)
}
