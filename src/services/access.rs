//! Access gate: turns API tokens into owner identities.
//!
//! Owner scoping itself is enforced in every ledger query; this module only
//! establishes who the caller is.

use crate::{
    models::owner::{Owner, User},
    services::{
        hasher::hash_bytes,
        storage_service::{StorageError, StorageResult},
    },
};
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Clone)]
pub struct AccessGate {
    db: Arc<SqlitePool>,
}

impl AccessGate {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Register a user and hand back their API token.
    ///
    /// The token is returned exactly once; only its SHA-256 is stored.
    pub async fn create_user(&self, email: &str) -> StorageResult<(User, String)> {
        let email = email.trim();
        if email.is_empty() || !email.contains('@') || email.len() > 254 {
            return Err(StorageError::InvalidEmail(email.to_string()));
        }

        let token = generate_token();
        let user = User {
            id: Uuid::new_v4(),
            email: email.to_ascii_lowercase(),
            token_hash: hash_bytes(token.as_bytes()).into_string(),
            created_at: Utc::now(),
        };

        match sqlx::query("INSERT INTO users (id, email, token_hash, created_at) VALUES (?, ?, ?, ?)")
            .bind(user.id)
            .bind(&user.email)
            .bind(&user.token_hash)
            .bind(user.created_at)
            .execute(&*self.db)
            .await
        {
            Ok(_) => {
                info!(user = %user.id, email = %user.email, "created user");
                Ok((user, token))
            }
            Err(err) if is_unique_violation(&err) => Err(StorageError::UserAlreadyExists(user.email)),
            Err(err) => Err(StorageError::Sqlx(err)),
        }
    }

    pub async fn find_user_by_email(&self, email: &str) -> StorageResult<Option<User>> {
        Ok(sqlx::query_as::<_, User>(
            "SELECT id, email, token_hash, created_at FROM users WHERE email = ?",
        )
        .bind(email.trim().to_ascii_lowercase())
        .fetch_optional(&*self.db)
        .await?)
    }

    /// Resolve a raw API token to its owner.
    pub async fn authenticate(&self, token: &str) -> StorageResult<Owner> {
        if token.is_empty() {
            return Err(StorageError::Unauthenticated);
        }
        let token_hash = hash_bytes(token.as_bytes());
        sqlx::query_as::<_, User>(
            "SELECT id, email, token_hash, created_at FROM users WHERE token_hash = ?",
        )
        .bind(token_hash.as_str())
        .fetch_optional(&*self.db)
        .await?
        .map(Owner::from)
        .ok_or(StorageError::Unauthenticated)
    }
}

/// Extract the token from an `Authorization` header value.
///
/// Accepts `Token <token>` and `Bearer <token>`.
pub fn token_from_header(value: &str) -> Option<&str> {
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("token") && !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// 64 hex characters drawn from two v4 UUIDs.
fn generate_token() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
