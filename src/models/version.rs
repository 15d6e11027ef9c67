//! Represents one immutable upload event of a logical file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A single version of a logical file.
///
/// Rows are written once by the ledger. Only `content_type` may change later;
/// `version_number`, `content_hash` and `content_ref` never do.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct Version {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Parent logical file.
    pub file_id: Uuid,

    /// Name of the parent logical file (joined in on read).
    pub file_name: String,

    /// Denormalized owner for owner-scoped queries.
    pub owner_id: Uuid,

    /// 1-based, gap-free sequence number within the logical file.
    pub version_number: i64,

    /// Opaque content store reference. Absent when no bytes are attached.
    pub content_ref: Option<String>,

    /// SHA-256 of the uploaded bytes, 64 lowercase hex characters.
    pub content_hash: String,

    /// Size in bytes.
    pub size_bytes: i64,

    /// Content type (MIME type) supplied at upload time.
    pub content_type: Option<String>,

    /// Timestamp of the upload.
    pub created_at: DateTime<Utc>,
}

/// Fields supplied to the ledger when recording a new version.
#[derive(Clone, Debug)]
pub struct NewVersion {
    pub content_ref: Option<String>,
    pub content_hash: String,
    pub size_bytes: i64,
    pub content_type: Option<String>,
}

/// Mutable metadata of an existing version.
#[derive(Clone, Debug, Default)]
pub struct VersionUpdate {
    pub content_type: Option<String>,
}
