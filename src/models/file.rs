//! Represents a logical file: the named slot versions accumulate under.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A name a user uploads under.
///
/// One row exists per `(owner_id, name)`; it is created on the first upload
/// and never mutated afterwards.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct LogicalFile {
    /// Stable identifier shared by every version of this file.
    pub id: Uuid,

    /// Owning user.
    pub owner_id: Uuid,

    /// File name (1-255 characters, no `/` or `\`).
    pub name: String,

    /// When the first version was uploaded.
    pub created_at: DateTime<Utc>,
}
