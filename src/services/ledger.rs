//! The version ledger: the authoritative record of logical files and their
//! versions, and the only place version numbers are allocated.
//!
//! Allocation runs as a single `INSERT … SELECT MAX(version_number) + 1`
//! statement guarded by the `(file_id, version_number)` unique constraint. A
//! losing writer sees a constraint violation (or a busy database) and retries
//! with a fresh read, so every successful upload gets the next number with no
//! gaps and no repeats.

use crate::{
    models::{
        file::LogicalFile,
        owner::Owner,
        version::{NewVersion, Version, VersionUpdate},
    },
    services::{
        hasher::ContentHash,
        storage_service::{StorageError, StorageResult},
    },
};
use chrono::Utc;
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

pub const MAX_FILE_NAME_LEN: usize = 255;
pub const MAX_ALLOCATION_ATTEMPTS: u32 = 5;
pub const MAX_LIST_LIMIT: usize = 1000;

const VERSION_SELECT: &str = "SELECT v.id, v.file_id, f.name AS file_name, v.owner_id, \
     v.version_number, v.content_ref, v.content_hash, v.size_bytes, v.content_type, \
     v.created_at \
     FROM versions v JOIN files f ON f.id = v.file_id";

/// Position after which a listing continues.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionCursor {
    pub file_name: String,
    pub version_number: i64,
}

#[derive(Clone, Debug)]
pub struct ListVersionsParams {
    pub limit: usize,
    pub cursor: Option<VersionCursor>,
}

impl Default for ListVersionsParams {
    fn default() -> Self {
        Self {
            limit: 100,
            cursor: None,
        }
    }
}

#[derive(Debug)]
pub struct ListVersionsResult {
    pub versions: Vec<Version>,
    pub is_truncated: bool,
    pub next_cursor: Option<VersionCursor>,
}

/// Validate a logical file name.
///
/// Names are 1-255 characters and may not contain path separators.
pub fn validate_file_name(name: &str) -> StorageResult<()> {
    if name.is_empty() {
        return Err(StorageError::InvalidFileName {
            reason: "is required".into(),
        });
    }
    if name.chars().count() > MAX_FILE_NAME_LEN {
        return Err(StorageError::InvalidFileName {
            reason: format!("must be at most {MAX_FILE_NAME_LEN} characters"),
        });
    }
    if name.contains('/') || name.contains('\\') {
        return Err(StorageError::InvalidFileName {
            reason: "cannot contain '/' or '\\'".into(),
        });
    }
    Ok(())
}

#[derive(Clone)]
pub struct VersionLedger {
    db: Arc<SqlitePool>,
}

impl VersionLedger {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Fetch the owner's logical file called `name`.
    pub async fn find_file(&self, owner: &Owner, name: &str) -> StorageResult<LogicalFile> {
        sqlx::query_as::<_, LogicalFile>(
            "SELECT id, owner_id, name, created_at FROM files WHERE owner_id = ? AND name = ?",
        )
        .bind(owner.id)
        .bind(name)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| StorageError::FileNotFound(name.to_string()))
    }

    /// Find or create the owner's logical file called `name`.
    ///
    /// The `(owner_id, name)` unique constraint turns concurrent first
    /// uploads into a no-op insert followed by a read of the winner's row.
    pub async fn find_or_create_file(&self, owner: &Owner, name: &str) -> StorageResult<LogicalFile> {
        validate_file_name(name)?;
        let inserted = sqlx::query(
            "INSERT INTO files (id, owner_id, name, created_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(owner_id, name) DO NOTHING",
        )
        .bind(Uuid::new_v4())
        .bind(owner.id)
        .bind(name)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;
        if inserted.rows_affected() > 0 {
            debug!(owner = %owner.id, file = name, "created logical file");
        }
        self.find_file(owner, name).await
    }

    /// Record a new version of `name` with the next free version number.
    ///
    /// Validation (name, non-empty content, hash format) happens before any
    /// row is written.
    pub async fn create_version(
        &self,
        owner: &Owner,
        name: &str,
        new: NewVersion,
    ) -> StorageResult<(LogicalFile, Version)> {
        validate_file_name(name)?;
        if new.size_bytes <= 0 {
            return Err(StorageError::EmptyContent);
        }
        let content_hash = ContentHash::parse(&new.content_hash)?;

        let file = self.find_or_create_file(owner, name).await?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let id = Uuid::new_v4();
            let created_at = Utc::now();

            let inserted = sqlx::query_scalar::<_, i64>(
                r#"
                INSERT INTO versions (
                    id, file_id, owner_id, version_number, content_ref,
                    content_hash, size_bytes, content_type, created_at
                )
                SELECT ?, ?, ?, COALESCE(MAX(version_number), 0) + 1, ?, ?, ?, ?, ?
                FROM versions WHERE file_id = ?
                RETURNING version_number
                "#,
            )
            .bind(id)
            .bind(file.id)
            .bind(owner.id)
            .bind(new.content_ref.as_deref())
            .bind(content_hash.as_str())
            .bind(new.size_bytes)
            .bind(new.content_type.as_deref())
            .bind(created_at)
            .bind(file.id)
            .fetch_one(&*self.db)
            .await;

            match inserted {
                Ok(version_number) => {
                    let version = Version {
                        id,
                        file_id: file.id,
                        file_name: file.name.clone(),
                        owner_id: owner.id,
                        version_number,
                        content_ref: new.content_ref,
                        content_hash: content_hash.into_string(),
                        size_bytes: new.size_bytes,
                        content_type: new.content_type,
                        created_at,
                    };
                    return Ok((file, version));
                }
                Err(err) if is_allocation_conflict(&err) => {
                    if attempt >= MAX_ALLOCATION_ATTEMPTS {
                        return Err(StorageError::AllocationConflict {
                            name: name.to_string(),
                            attempts: attempt,
                        });
                    }
                    warn!(
                        file = name,
                        attempt,
                        error = %err,
                        "version number allocation conflict, retrying"
                    );
                    tokio::task::yield_now().await;
                }
                Err(err) => return Err(StorageError::Sqlx(err)),
            }
        }
    }

    /// All versions of `name`, ascending by version number.
    pub async fn list_versions(&self, owner: &Owner, name: &str) -> StorageResult<Vec<Version>> {
        let file = self.find_file(owner, name).await?;
        let sql = format!(
            "{VERSION_SELECT} WHERE v.file_id = ? AND v.owner_id = ? ORDER BY v.version_number ASC"
        );
        Ok(sqlx::query_as::<_, Version>(&sql)
            .bind(file.id)
            .bind(owner.id)
            .fetch_all(&*self.db)
            .await?)
    }

    /// The version at zero-based `revision_index` of the ascending sequence.
    pub async fn get_version(
        &self,
        owner: &Owner,
        name: &str,
        revision_index: i64,
    ) -> StorageResult<Version> {
        let not_found = || StorageError::RevisionNotFound {
            name: name.to_string(),
            revision: revision_index.to_string(),
        };
        if revision_index < 0 {
            return Err(not_found());
        }
        let file = self.find_file(owner, name).await?;
        let sql = format!(
            "{VERSION_SELECT} WHERE v.file_id = ? AND v.owner_id = ? \
             ORDER BY v.version_number ASC LIMIT 1 OFFSET ?"
        );
        sqlx::query_as::<_, Version>(&sql)
            .bind(file.id)
            .bind(owner.id)
            .bind(revision_index)
            .fetch_optional(&*self.db)
            .await?
            .ok_or_else(not_found)
    }

    /// The version of `name` with the greatest version number.
    pub async fn get_latest(&self, owner: &Owner, name: &str) -> StorageResult<Version> {
        let file = self.find_file(owner, name).await?;
        let sql = format!(
            "{VERSION_SELECT} WHERE v.file_id = ? AND v.owner_id = ? \
             ORDER BY v.version_number DESC LIMIT 1"
        );
        sqlx::query_as::<_, Version>(&sql)
            .bind(file.id)
            .bind(owner.id)
            .fetch_optional(&*self.db)
            .await?
            .ok_or_else(|| StorageError::RevisionNotFound {
                name: name.to_string(),
                revision: "latest".into(),
            })
    }

    /// The owner's version carrying `hash`.
    ///
    /// Identical content may have been uploaded several times; the most
    /// recently recorded version wins.
    pub async fn find_by_hash(&self, owner: &Owner, hash: &ContentHash) -> StorageResult<Version> {
        let sql = format!(
            "{VERSION_SELECT} WHERE v.owner_id = ? AND v.content_hash = ? \
             ORDER BY v.rowid DESC LIMIT 1"
        );
        sqlx::query_as::<_, Version>(&sql)
            .bind(owner.id)
            .bind(hash.as_str())
            .fetch_optional(&*self.db)
            .await?
            .ok_or_else(|| StorageError::VersionNotFound(hash.to_string()))
    }

    pub async fn get_by_id(&self, owner: &Owner, id: Uuid) -> StorageResult<Version> {
        let sql = format!("{VERSION_SELECT} WHERE v.id = ? AND v.owner_id = ?");
        sqlx::query_as::<_, Version>(&sql)
            .bind(id)
            .bind(owner.id)
            .fetch_optional(&*self.db)
            .await?
            .ok_or_else(|| StorageError::VersionNotFound(id.to_string()))
    }

    /// Page through every version the owner has, ordered by file name then
    /// version number.
    pub async fn list_all(
        &self,
        owner: &Owner,
        params: &ListVersionsParams,
    ) -> StorageResult<ListVersionsResult> {
        let limit = params.limit.clamp(1, MAX_LIST_LIMIT);
        let fetch_limit = limit + 1;

        let mut builder = QueryBuilder::<Sqlite>::new(VERSION_SELECT);
        builder.push(" WHERE v.owner_id = ");
        builder.push_bind(owner.id);

        if let Some(cursor) = &params.cursor {
            builder.push(" AND (f.name > ");
            builder.push_bind(cursor.file_name.clone());
            builder.push(" OR (f.name = ");
            builder.push_bind(cursor.file_name.clone());
            builder.push(" AND v.version_number > ");
            builder.push_bind(cursor.version_number);
            builder.push("))");
        }

        builder.push(" ORDER BY f.name ASC, v.version_number ASC LIMIT ");
        builder.push_bind(fetch_limit as i64);

        let mut versions: Vec<Version> = builder.build_query_as().fetch_all(&*self.db).await?;

        let is_truncated = versions.len() == fetch_limit;
        if is_truncated {
            versions.pop();
        }
        let next_cursor = if is_truncated {
            versions.last().map(|v| VersionCursor {
                file_name: v.file_name.clone(),
                version_number: v.version_number,
            })
        } else {
            None
        };

        Ok(ListVersionsResult {
            versions,
            is_truncated,
            next_cursor,
        })
    }

    /// Apply a metadata update. Number, hash and content are never touched.
    pub async fn update_metadata(
        &self,
        owner: &Owner,
        id: Uuid,
        update: &VersionUpdate,
    ) -> StorageResult<Version> {
        if let Some(content_type) = &update.content_type {
            let result = sqlx::query(
                "UPDATE versions SET content_type = ? WHERE id = ? AND owner_id = ?",
            )
            .bind(content_type)
            .bind(id)
            .bind(owner.id)
            .execute(&*self.db)
            .await?;
            if result.rows_affected() == 0 {
                return Err(StorageError::VersionNotFound(id.to_string()));
            }
        }
        self.get_by_id(owner, id).await
    }

    /// Remove one version row. Sibling versions keep their numbers.
    pub async fn delete_version(&self, owner: &Owner, id: Uuid) -> StorageResult<Version> {
        let version = self.get_by_id(owner, id).await?;
        let result = sqlx::query("DELETE FROM versions WHERE id = ? AND owner_id = ?")
            .bind(id)
            .bind(owner.id)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::VersionNotFound(id.to_string()));
        }
        Ok(version)
    }

    /// Number of versions, across all owners, pointing at `content_ref`.
    pub async fn count_references(&self, content_ref: &str) -> StorageResult<i64> {
        Ok(
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM versions WHERE content_ref = ?")
                .bind(content_ref)
                .fetch_one(&*self.db)
                .await?,
        )
    }
}

/// Return true if a version insert lost a race and should be retried.
///
/// Covers the `(file_id, version_number)` unique constraint and SQLite
/// reporting the database as busy or locked.
fn is_allocation_conflict(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            let message = db_err.message().to_ascii_lowercase();
            message.contains("unique") || message.contains("locked") || message.contains("busy")
        }
        _ => false,
    }
}
