//! Defines routes for all document store operations.
//!
//! ## Structure
//! - **Version endpoints** (authenticated, owner-scoped)
//!   - `POST   /api/file_versions`                    : upload a new version (multipart)
//!   - `GET    /api/file_versions`                    : list versions (supports limit, cursor)
//!   - `GET    /api/file_versions/{id}`               : version detail
//!   - `PATCH  /api/file_versions/{id}`               : update content type
//!   - `DELETE /api/file_versions/{id}`               : delete a version
//!   - `GET    /api/file_versions/{id}/content`       : download bytes
//!   - `GET    /api/file_versions/{id}/share`         : shareable link
//!   - `GET    /api/file_versions/by_hash/{hash}`     : lookup by content hash
//!
//! - **By-path endpoints**
//!   - `GET    /api/files/{name}?revision=N`          : latest or zero-based revision
//!   - `GET    /api/files/{name}/versions`            : all versions of one file

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        version_handlers::{
            delete_version, download_content, get_by_hash, get_by_path, get_version,
            list_file_versions, list_versions, share_version, update_version, upload_version,
        },
    },
    services::storage_service::StorageService,
};
use axum::{Router, extract::DefaultBodyLimit, routing::get};

/// Build and return the router for all document store routes.
///
/// `body_limit` caps request bodies; it should leave room for multipart
/// framing on top of the largest accepted upload.
pub fn routes(body_limit: usize) -> Router<StorageService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Version routes
        .route("/api/file_versions", get(list_versions).post(upload_version))
        .route("/api/file_versions/by_hash/{content_hash}", get(get_by_hash))
        .route(
            "/api/file_versions/{id}",
            get(get_version)
                .patch(update_version)
                .put(update_version)
                .delete(delete_version),
        )
        .route("/api/file_versions/{id}/content", get(download_content))
        .route("/api/file_versions/{id}/share", get(share_version))
        // By-path routes
        .route("/api/files/{name}", get(get_by_path))
        .route("/api/files/{name}/versions", get(list_file_versions))
        .layer(DefaultBodyLimit::max(body_limit))
}
