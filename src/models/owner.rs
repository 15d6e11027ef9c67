//! Represents the identity every file and version is partitioned by.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A registered user of the store.
///
/// Only the SHA-256 of the API token is persisted, never the token itself.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct User {
    pub id: Uuid,

    /// Unique login e-mail.
    pub email: String,

    #[serde(skip_serializing)]
    pub token_hash: String,

    pub created_at: DateTime<Utc>,
}

/// Authenticated identity passed explicitly into every core operation.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Owner {
    pub id: Uuid,
    pub email: String,
}

impl From<User> for Owner {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            email: user.email,
        }
    }
}
