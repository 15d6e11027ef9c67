//! src/services/storage_service.rs
//!
//! StorageService: the upload and retrieval pipeline of the document store.
//! Metadata lives in SQLite (through [`VersionLedger`]) and payloads in a
//! [`ContentStore`]. Every operation takes the calling [`Owner`] explicitly and
//! never sees another owner's rows.

use crate::{
    models::{
        owner::Owner,
        version::{NewVersion, Version, VersionUpdate},
    },
    services::{
        access::AccessGate,
        content_store::{ContentReader, ContentRef, ContentStore, ContentStream},
        ledger::{ListVersionsParams, ListVersionsResult, VersionLedger, validate_file_name},
        lookup::LookupService,
    },
};
use bytes::Bytes;
use futures::StreamExt;
use sqlx::SqlitePool;
use std::{io, sync::Arc};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default upload limit (10 MiB).
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("file name {reason}")]
    InvalidFileName { reason: String },
    #[error("file must not be empty")]
    EmptyContent,
    #[error("file size must not exceed {limit} bytes")]
    ContentTooLarge { limit: u64 },
    #[error("`{0}` is not a 64-character hexadecimal content hash")]
    InvalidContentHash(String),
    #[error("`{0}` is not a valid e-mail address")]
    InvalidEmail(String),
    #[error("field `{0}` is read-only")]
    ReadOnlyField(&'static str),
    #[error("field `{0}` is required")]
    MissingField(&'static str),
    #[error("invalid pagination cursor")]
    InvalidCursor,
    #[error("file `{0}` not found")]
    FileNotFound(String),
    #[error("version `{0}` not found")]
    VersionNotFound(String),
    #[error("revision `{revision}` of `{name}` not found")]
    RevisionNotFound { name: String, revision: String },
    #[error("content `{0}` not found")]
    ContentNotFound(String),
    #[error("authentication credentials were not provided or are invalid")]
    Unauthenticated,
    #[error("user `{0}` already exists")]
    UserAlreadyExists(String),
    #[error("could not allocate a version number for `{name}` after {attempts} attempts")]
    AllocationConflict { name: String, attempts: u32 },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StorageError {
    /// Request field a validation failure refers to.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Self::InvalidFileName { .. } => Some("file_name"),
            Self::EmptyContent | Self::ContentTooLarge { .. } => Some("file"),
            Self::InvalidContentHash(_) => Some("content_hash"),
            Self::InvalidEmail(_) => Some("email"),
            Self::ReadOnlyField(field) | Self::MissingField(field) => Some(field),
            Self::InvalidCursor => Some("cursor"),
            _ => None,
        }
    }

    pub fn is_validation(&self) -> bool {
        self.field().is_some()
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::FileNotFound(_)
                | Self::VersionNotFound(_)
                | Self::RevisionNotFound { .. }
                | Self::ContentNotFound(_)
        )
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

const CONTENT_LOCK_STRIPES: usize = 64;

/// Per-hash mutual exclusion between "commit bytes + record version" and
/// "count references + remove bytes".
///
/// Hashes are spread over a fixed set of stripes; unrelated hashes that share
/// a stripe merely wait for each other.
#[derive(Clone)]
struct ContentLocks {
    stripes: Arc<[Mutex<()>]>,
}

impl ContentLocks {
    fn new() -> Self {
        Self {
            stripes: (0..CONTENT_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    async fn lock(&self, reference: &str) -> MutexGuard<'_, ()> {
        let slot = reference
            .bytes()
            .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(usize::from(b)));
        self.stripes[slot % self.stripes.len()].lock().await
    }
}

/// StorageService ties the pieces of the store together:
/// - Upload: validate name, reject empty streams, hash-while-storing, record a version
/// - Read: detail, list, by path, by content hash, content download
/// - Update: content type only
/// - Delete: drop the version row, then the bytes once nothing references them
///
/// Cloned into every axum handler as router state.
#[derive(Clone)]
pub struct StorageService {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Backing storage for version payloads.
    pub content: Arc<dyn ContentStore>,

    pub ledger: VersionLedger,
    pub lookup: LookupService,
    pub access: AccessGate,

    /// Largest accepted upload in bytes.
    pub max_upload_bytes: u64,

    /// Absolute prefix for shareable links, e.g. `https://docs.example.com`.
    pub public_base_url: Option<String>,

    content_locks: ContentLocks,
}

impl StorageService {
    /// Create a StorageService backed by the provided SQLite pool and content store.
    pub fn new(db: Arc<SqlitePool>, content: Arc<dyn ContentStore>) -> Self {
        let ledger = VersionLedger::new(db.clone());
        Self {
            lookup: LookupService::new(ledger.clone()),
            access: AccessGate::new(db.clone()),
            ledger,
            db,
            content,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            public_base_url: None,
            content_locks: ContentLocks::new(),
        }
    }

    pub fn with_max_upload_bytes(mut self, max_upload_bytes: u64) -> Self {
        self.max_upload_bytes = max_upload_bytes;
        self
    }

    pub fn with_public_base_url(mut self, public_base_url: Option<String>) -> Self {
        self.public_base_url = public_base_url.map(|url| url.trim_end_matches('/').to_string());
        self
    }

    /// Stream-upload a new version of `name`.
    ///
    /// - Validates the name before reading any bytes.
    /// - Rejects a stream without a single byte before hashing.
    /// - Hashes while staging into the content store, enforcing the size limit.
    /// - Under the per-hash lock, commits the bytes and allocates the next
    ///   version number in the ledger, so a concurrent delete of the last
    ///   version sharing these bytes cannot remove them in between.
    ///
    /// A failed ledger write releases the stored bytes unless another version
    /// already references them.
    pub async fn upload_version_stream(
        &self,
        owner: &Owner,
        name: &str,
        content_type: Option<String>,
        mut stream: ContentStream<'_>,
    ) -> StorageResult<Version> {
        validate_file_name(name)?;

        let first = loop {
            match stream.next().await {
                Some(Ok(chunk)) if chunk.is_empty() => continue,
                Some(Ok(chunk)) => break chunk,
                Some(Err(err)) => return Err(StorageError::Io(err)),
                None => return Err(StorageError::EmptyContent),
            }
        };
        let body = futures::stream::once(async move { Ok::<Bytes, io::Error>(first) })
            .chain(stream)
            .boxed();

        let staged = self
            .content
            .stage(body, Some(self.max_upload_bytes))
            .await?;
        let _guard = self.content_locks.lock(staged.content_hash.as_str()).await;
        let stored = self.content.commit(staged).await?;

        let new_version = NewVersion {
            content_ref: Some(stored.reference.as_str().to_string()),
            content_hash: stored.content_hash.as_str().to_string(),
            size_bytes: stored.size_bytes as i64,
            content_type,
        };

        match self.ledger.create_version(owner, name, new_version).await {
            Ok((_, version)) => {
                info!(
                    owner = %owner.id,
                    file = %version.file_name,
                    version = version.version_number,
                    hash = %version.content_hash,
                    "uploaded new version"
                );
                Ok(version)
            }
            Err(err) => {
                self.release_unreferenced(&stored.reference).await;
                Err(err)
            }
        }
    }

    /// Upload a complete in-memory buffer.
    pub async fn upload_version(
        &self,
        owner: &Owner,
        name: &str,
        content_type: Option<String>,
        content: Bytes,
    ) -> StorageResult<Version> {
        let stream = futures::stream::once(async move { Ok::<Bytes, io::Error>(content) }).boxed();
        self.upload_version_stream(owner, name, content_type, stream)
            .await
    }

    /// Fetch a version by id within the owner's scope.
    pub async fn get_version(&self, owner: &Owner, id: Uuid) -> StorageResult<Version> {
        self.ledger.get_by_id(owner, id).await
    }

    /// List all of the owner's versions, ordered by file name then version number.
    pub async fn list_versions(
        &self,
        owner: &Owner,
        params: ListVersionsParams,
    ) -> StorageResult<ListVersionsResult> {
        self.ledger.list_all(owner, &params).await
    }

    /// Versions of one logical file in ascending order.
    pub async fn list_file_versions(&self, owner: &Owner, name: &str) -> StorageResult<Vec<Version>> {
        self.ledger.list_versions(owner, name).await
    }

    /// Resolve `name` to its latest version or to a zero-based revision index.
    pub async fn get_by_path(
        &self,
        owner: &Owner,
        name: &str,
        revision: Option<&str>,
    ) -> StorageResult<Version> {
        self.lookup.by_path(owner, name, revision).await
    }

    /// Resolve a raw content hash within the owner's scope.
    pub async fn get_by_content_hash(&self, owner: &Owner, raw_hash: &str) -> StorageResult<Version> {
        self.lookup.by_content_hash(owner, raw_hash).await
    }

    /// Change the mutable metadata of a version.
    pub async fn update_version(
        &self,
        owner: &Owner,
        id: Uuid,
        update: VersionUpdate,
    ) -> StorageResult<Version> {
        self.ledger.update_metadata(owner, id, &update).await
    }

    /// Delete a version. Siblings keep their numbers.
    pub async fn delete_version(&self, owner: &Owner, id: Uuid) -> StorageResult<Version> {
        let version = self.ledger.delete_version(owner, id).await?;
        if let Some(reference) = &version.content_ref {
            self.release_content(&ContentRef::new(reference.clone())).await;
        }
        info!(
            owner = %owner.id,
            file = %version.file_name,
            version = version.version_number,
            "deleted version"
        );
        Ok(version)
    }

    /// Open a version's bytes for streaming out.
    pub async fn open_content(
        &self,
        owner: &Owner,
        id: Uuid,
    ) -> StorageResult<(Version, ContentReader)> {
        let version = self.ledger.get_by_id(owner, id).await?;
        let reference = Self::content_ref_of(&version)?;
        let reader = self.content.open(&reference).await?;
        Ok((version, reader))
    }

    /// Read a version's bytes into memory.
    pub async fn retrieve_content(&self, owner: &Owner, id: Uuid) -> StorageResult<(Version, Bytes)> {
        let version = self.ledger.get_by_id(owner, id).await?;
        let reference = Self::content_ref_of(&version)?;
        let data = self.content.retrieve(&reference).await?;
        Ok((version, data))
    }

    /// Link a client can follow to download the version's bytes.
    pub fn shareable_link(&self, version: &Version) -> Option<String> {
        version.content_ref.as_ref()?;
        let path = format!("/api/file_versions/{}/content", version.id);
        Some(match &self.public_base_url {
            Some(base) => format!("{base}{path}"),
            None => path,
        })
    }

    fn content_ref_of(version: &Version) -> StorageResult<ContentRef> {
        version
            .content_ref
            .clone()
            .map(ContentRef::new)
            .ok_or_else(|| StorageError::ContentNotFound(version.id.to_string()))
    }

    /// Remove stored bytes once no version points at them any more.
    ///
    /// Best-effort: the metadata change has already happened, so failures are
    /// logged rather than returned.
    async fn release_content(&self, reference: &ContentRef) {
        let _guard = self.content_locks.lock(reference.as_str()).await;
        self.release_unreferenced(reference).await;
    }

    /// Caller holds the content lock for `reference`.
    async fn release_unreferenced(&self, reference: &ContentRef) {
        match self.ledger.count_references(reference.as_str()).await {
            Ok(0) => match self.content.remove(reference).await {
                Ok(()) => debug!(%reference, "released unreferenced content"),
                Err(err) => warn!(%reference, error = %err, "failed to remove content"),
            },
            Ok(remaining) => debug!(%reference, remaining, "content still referenced"),
            Err(err) => warn!(%reference, error = %err, "failed to count content references"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        content_store::{MemoryContentStore, StagedContent, StoredContent},
        hasher::hash_bytes,
        test_support::{test_pool, test_user},
    };
    use async_trait::async_trait;
    use futures::stream;
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    };
    use tokio::sync::Notify;

    /// Memory store that can hold an upload right after its bytes are committed.
    #[derive(Default)]
    struct PausingStore {
        inner: MemoryContentStore,
        pause_after_commit: AtomicBool,
        committed: Notify,
        resume: Notify,
    }

    #[async_trait]
    impl ContentStore for PausingStore {
        async fn stage(
            &self,
            stream: ContentStream<'_>,
            max_bytes: Option<u64>,
        ) -> StorageResult<StagedContent> {
            self.inner.stage(stream, max_bytes).await
        }

        async fn commit(&self, staged: StagedContent) -> StorageResult<StoredContent> {
            let stored = self.inner.commit(staged).await?;
            if self.pause_after_commit.swap(false, Ordering::SeqCst) {
                self.committed.notify_one();
                self.resume.notified().await;
            }
            Ok(stored)
        }

        async fn retrieve(&self, reference: &ContentRef) -> StorageResult<Bytes> {
            self.inner.retrieve(reference).await
        }

        async fn open(&self, reference: &ContentRef) -> StorageResult<ContentReader> {
            self.inner.open(reference).await
        }

        async fn remove(&self, reference: &ContentRef) -> StorageResult<()> {
            self.inner.remove(reference).await
        }

        async fn health_check(&self) -> StorageResult<()> {
            Ok(())
        }
    }

    async fn service() -> (tempfile::TempDir, StorageService, MemoryContentStore) {
        let (dir, pool) = test_pool().await;
        let content = MemoryContentStore::new();
        let service = StorageService::new(pool, Arc::new(content.clone()));
        (dir, service, content)
    }

    #[tokio::test]
    async fn upload_assigns_sequential_versions_and_hashes() {
        let (_dir, service, _) = service().await;
        let owner = test_user(&service.db, "alice@example.com").await;

        let v1 = service
            .upload_version(&owner, "report.txt", None, Bytes::from_static(b"first version"))
            .await
            .unwrap();
        let v2 = service
            .upload_version(&owner, "report.txt", None, Bytes::from_static(b"second version"))
            .await
            .unwrap();

        assert_eq!(v1.version_number, 1);
        assert_eq!(v2.version_number, 2);
        assert_eq!(v1.file_id, v2.file_id);
        assert_eq!(v1.content_hash, hash_bytes(b"first version").as_str());
        assert_ne!(v1.content_hash, v2.content_hash);

        let (_, data) = service.retrieve_content(&owner, v2.id).await.unwrap();
        assert_eq!(&data[..], b"second version");
    }

    #[tokio::test]
    async fn empty_stream_is_rejected_without_side_effects() {
        let (_dir, service, content) = service().await;
        let owner = test_user(&service.db, "alice@example.com").await;

        let empty_chunks = stream::iter(vec![Ok(Bytes::new()), Ok(Bytes::new())]).boxed();
        let err = service
            .upload_version_stream(&owner, "empty.txt", None, empty_chunks)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::EmptyContent));
        assert_eq!(err.field(), Some("file"));

        assert!(content.is_empty().await);
        assert!(matches!(
            service.list_file_versions(&owner, "empty.txt").await,
            Err(StorageError::FileNotFound(_))
        ));
    }

    #[tokio::test]
    async fn invalid_name_is_rejected_before_storing() {
        let (_dir, service, content) = service().await;
        let owner = test_user(&service.db, "alice@example.com").await;

        let too_long = "x".repeat(256);
        for name in ["a/b", "a\\b", "", too_long.as_str()] {
            let err = service
                .upload_version(&owner, name, None, Bytes::from_static(b"data"))
                .await
                .unwrap_err();
            assert!(matches!(err, StorageError::InvalidFileName { .. }), "{name}");
        }
        assert!(content.is_empty().await);
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected() {
        let (_dir, service, content) = service().await;
        let service = service.with_max_upload_bytes(4);
        let owner = test_user(&service.db, "alice@example.com").await;

        let err = service
            .upload_version(&owner, "big.bin", None, Bytes::from_static(b"12345"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ContentTooLarge { limit: 4 }));
        assert!(content.is_empty().await);
    }

    #[tokio::test]
    async fn identical_content_is_shared_and_released_with_last_reference() {
        let (_dir, service, content) = service().await;
        let alice = test_user(&service.db, "alice@example.com").await;
        let bob = test_user(&service.db, "bob@example.com").await;

        let a = service
            .upload_version(&alice, "doc.txt", None, Bytes::from_static(b"shared"))
            .await
            .unwrap();
        let b = service
            .upload_version(&bob, "doc.txt", None, Bytes::from_static(b"shared"))
            .await
            .unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(a.content_hash, b.content_hash);
        assert_eq!(content.len().await, 1);

        service.delete_version(&alice, a.id).await.unwrap();
        assert_eq!(content.len().await, 1);
        let (_, data) = service.retrieve_content(&bob, b.id).await.unwrap();
        assert_eq!(&data[..], b"shared");

        service.delete_version(&bob, b.id).await.unwrap();
        assert!(content.is_empty().await);
    }

    #[tokio::test]
    async fn delete_does_not_renumber_siblings() {
        let (_dir, service, _) = service().await;
        let owner = test_user(&service.db, "alice@example.com").await;

        let mut ids = Vec::new();
        let bodies: [&[u8]; 3] = [b"one", b"two", b"three"];
        for body in bodies {
            let v = service
                .upload_version(&owner, "notes.md", None, Bytes::copy_from_slice(body))
                .await
                .unwrap();
            ids.push(v.id);
        }
        service.delete_version(&owner, ids[1]).await.unwrap();

        let numbers: Vec<i64> = service
            .list_file_versions(&owner, "notes.md")
            .await
            .unwrap()
            .iter()
            .map(|v| v.version_number)
            .collect();
        assert_eq!(numbers, vec![1, 3]);

        let next = service
            .upload_version(&owner, "notes.md", None, Bytes::from_static(b"four"))
            .await
            .unwrap();
        assert_eq!(next.version_number, 4);
    }

    #[tokio::test]
    async fn other_owner_sees_nothing() {
        let (_dir, service, _) = service().await;
        let alice = test_user(&service.db, "alice@example.com").await;
        let mallory = test_user(&service.db, "mallory@example.com").await;

        let v = service
            .upload_version(&alice, "secret.txt", None, Bytes::from_static(b"secret"))
            .await
            .unwrap();

        assert!(service.get_version(&mallory, v.id).await.unwrap_err().is_not_found());
        assert!(service.retrieve_content(&mallory, v.id).await.unwrap_err().is_not_found());
        assert!(
            service
                .update_version(&mallory, v.id, VersionUpdate::default())
                .await
                .unwrap_err()
                .is_not_found()
        );
        assert!(service.delete_version(&mallory, v.id).await.unwrap_err().is_not_found());
        assert!(
            service
                .get_by_path(&mallory, "secret.txt", None)
                .await
                .unwrap_err()
                .is_not_found()
        );
        assert!(
            service
                .get_by_content_hash(&mallory, &v.content_hash)
                .await
                .unwrap_err()
                .is_not_found()
        );

        // still intact for the owner
        assert_eq!(service.get_version(&alice, v.id).await.unwrap(), v);
    }

    #[tokio::test]
    async fn shareable_link_uses_public_base_url() {
        let (_dir, service, _) = service().await;
        let service = service.with_public_base_url(Some("https://docs.example.com/".into()));
        let owner = test_user(&service.db, "alice@example.com").await;

        let v = service
            .upload_version(&owner, "a.txt", None, Bytes::from_static(b"a"))
            .await
            .unwrap();
        assert_eq!(
            service.shareable_link(&v).unwrap(),
            format!("https://docs.example.com/api/file_versions/{}/content", v.id)
        );
    }

    #[tokio::test]
    async fn delete_racing_an_upload_of_the_same_bytes_keeps_them() {
        let (_dir, pool) = test_pool().await;
        let store = Arc::new(PausingStore::default());
        let service = StorageService::new(pool, store.clone());
        let alice = test_user(&service.db, "alice@example.com").await;
        let bob = test_user(&service.db, "bob@example.com").await;

        let first = service
            .upload_version(&alice, "a.txt", None, Bytes::from_static(b"shared"))
            .await
            .unwrap();

        // bob's bytes are committed (deduplicated), his row is not yet written
        store.pause_after_commit.store(true, Ordering::SeqCst);
        let upload = tokio::spawn({
            let service = service.clone();
            let bob = bob.clone();
            async move {
                service
                    .upload_version(&bob, "b.txt", None, Bytes::from_static(b"shared"))
                    .await
            }
        });
        store.committed.notified().await;

        // alice drops the only recorded reference meanwhile
        let delete = tokio::spawn({
            let service = service.clone();
            let alice = alice.clone();
            async move { service.delete_version(&alice, first.id).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.resume.notify_one();

        let second = upload.await.unwrap().unwrap();
        delete.await.unwrap().unwrap();

        let (_, data) = service.retrieve_content(&bob, second.id).await.unwrap();
        assert_eq!(&data[..], b"shared");
        assert_eq!(store.inner.len().await, 1);
    }

    #[tokio::test]
    async fn upload_after_bytes_were_released_stores_them_again() {
        let (_dir, service, content) = service().await;
        let alice = test_user(&service.db, "alice@example.com").await;

        let first = service
            .upload_version(&alice, "a.txt", None, Bytes::from_static(b"again"))
            .await
            .unwrap();
        service.delete_version(&alice, first.id).await.unwrap();
        assert!(content.is_empty().await);

        let second = service
            .upload_version(&alice, "a.txt", None, Bytes::from_static(b"again"))
            .await
            .unwrap();
        let (_, data) = service.retrieve_content(&alice, second.id).await.unwrap();
        assert_eq!(&data[..], b"again");
    }
}
