//! Durable byte storage keyed by content.
//!
//! The reference handed back by a store is the SHA-256 of the bytes, so
//! identical uploads share one payload no matter who uploaded them. Version
//! rows in the ledger stay per owner and per upload; the store only ever sees
//! anonymous bytes.

use crate::services::{
    hasher::{CONTENT_HASH_HEX_LEN, ContentHash, hash_stream},
    storage_service::{StorageError, StorageResult},
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use std::{
    collections::HashMap,
    fmt,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::AsyncRead,
    sync::RwLock,
};
use tracing::debug;
use uuid::Uuid;

/// Chunked byte stream fed into [`ContentStore::store_stream`].
pub type ContentStream<'a> = BoxStream<'a, io::Result<Bytes>>;

/// Reader handed out for streaming downloads.
pub type ContentReader = Box<dyn AsyncRead + Send + Unpin>;

/// Opaque handle identifying stored bytes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ContentRef(String);

impl ContentRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the reference has the shape this crate's stores hand out.
    fn is_well_formed(&self) -> bool {
        self.0.len() == CONTENT_HASH_HEX_LEN
            && self.0.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    }
}

impl From<ContentHash> for ContentRef {
    fn from(hash: ContentHash) -> Self {
        Self(hash.into_string())
    }
}

impl fmt::Display for ContentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of persisting a byte stream.
#[derive(Clone, Debug)]
pub struct StoredContent {
    pub reference: ContentRef,
    pub content_hash: ContentHash,
    pub size_bytes: u64,
}

/// Bytes that have been hashed and set aside but are not addressable yet.
///
/// Produced by [`ContentStore::stage`] and consumed by
/// [`ContentStore::commit`] on the same store.
#[derive(Debug)]
pub struct StagedContent {
    pub content_hash: ContentHash,
    pub size_bytes: u64,
    location: StagedLocation,
}

#[derive(Debug)]
enum StagedLocation {
    File(PathBuf),
    Memory(Bytes),
}

fn foreign_staging() -> StorageError {
    StorageError::Io(io::Error::other("staged content belongs to another store"))
}

/// Write-once byte storage.
///
/// There is no update-in-place: a reference always resolves to the bytes it
/// was created from, or to nothing once removed.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Persist a complete buffer. Zero-length content is allowed here.
    async fn store(&self, content: Bytes) -> StorageResult<ContentRef> {
        let stream = futures::stream::once(async move { Ok::<_, io::Error>(content) }).boxed();
        Ok(self.store_stream(stream, None).await?.reference)
    }

    /// Persist a stream, hashing while writing.
    async fn store_stream(
        &self,
        stream: ContentStream<'_>,
        max_bytes: Option<u64>,
    ) -> StorageResult<StoredContent> {
        let staged = self.stage(stream, max_bytes).await?;
        self.commit(staged).await
    }

    /// Hash the stream while writing it aside.
    ///
    /// Fails with [`StorageError::ContentTooLarge`] once more than
    /// `max_bytes` have been read; nothing is kept in that case.
    async fn stage(
        &self,
        stream: ContentStream<'_>,
        max_bytes: Option<u64>,
    ) -> StorageResult<StagedContent>;

    /// Make staged bytes addressable under their hash.
    ///
    /// When the hash is already stored the staged copy is dropped; when the
    /// payload was removed since staging it is written again.
    async fn commit(&self, staged: StagedContent) -> StorageResult<StoredContent>;

    /// Read back the full payload.
    async fn retrieve(&self, reference: &ContentRef) -> StorageResult<Bytes>;

    /// Open the payload for streaming.
    async fn open(&self, reference: &ContentRef) -> StorageResult<ContentReader>;

    /// Drop the payload. Removing an unknown reference is not an error.
    async fn remove(&self, reference: &ContentRef) -> StorageResult<()>;

    /// Check that the backing storage is usable.
    async fn health_check(&self) -> StorageResult<()>;
}

const MAX_PLACE_ATTEMPTS: u32 = 3;

/// Content store on the local filesystem.
///
/// Payloads live at `base_path/{hash[0..2]}/{hash[2..4]}/{hash}`; uploads are
/// staged under `base_path/.staging` and renamed into place after fsync.
#[derive(Clone, Debug)]
pub struct FsContentStore {
    base_path: PathBuf,
}

impl FsContentStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn staging_dir(&self) -> PathBuf {
        self.base_path.join(".staging")
    }

    /// Resolve a reference to its payload path.
    ///
    /// Anything that is not a lowercase digest cannot have been produced by
    /// this store and is reported as missing instead of touching the disk.
    fn content_path(&self, reference: &ContentRef) -> StorageResult<PathBuf> {
        if !reference.is_well_formed() {
            return Err(StorageError::ContentNotFound(reference.to_string()));
        }
        let hash = reference.as_str();
        let mut path = self.base_path.clone();
        path.push(&hash[0..2]);
        path.push(&hash[2..4]);
        path.push(hash);
        Ok(path)
    }

    /// Copy the stream into `file`, returning its digest and length.
    async fn write_staged(
        file: &mut File,
        stream: ContentStream<'_>,
        max_bytes: Option<u64>,
    ) -> StorageResult<(ContentHash, u64)> {
        let written = hash_stream(stream, &mut *file, max_bytes).await?;
        file.sync_all().await?;
        Ok(written)
    }

    /// Move a fully written staging file to its content address.
    ///
    /// If the address is already occupied the bytes are identical by
    /// construction, so the staged copy is simply discarded. A shard directory
    /// pruned by a concurrent removal is recreated.
    async fn place(&self, tmp_path: &Path, final_path: &Path) -> StorageResult<()> {
        if fs::try_exists(final_path).await? {
            debug!("content {} already stored, dropping staged copy", final_path.display());
            let _ = fs::remove_file(tmp_path).await;
            return Ok(());
        }
        let mut attempt = 0;
        loop {
            attempt += 1;
            let placed = async {
                if let Some(parent) = final_path.parent() {
                    fs::create_dir_all(parent).await?;
                }
                fs::rename(tmp_path, final_path).await
            }
            .await;
            match placed {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    let _ = fs::remove_file(tmp_path).await;
                    return Ok(());
                }
                Err(err) if err.kind() == ErrorKind::NotFound && attempt < MAX_PLACE_ATTEMPTS => {
                    debug!(attempt, "shard directory vanished while placing content, retrying");
                }
                Err(err) => return Err(StorageError::Io(err)),
            }
        }
    }

    /// Remove empty shard directories up to (not including) the base path.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.base_path) && current != self.base_path {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

fn not_found_or_io(reference: &ContentRef, err: io::Error) -> StorageError {
    if err.kind() == ErrorKind::NotFound {
        StorageError::ContentNotFound(reference.to_string())
    } else {
        StorageError::Io(err)
    }
}

#[async_trait]
impl ContentStore for FsContentStore {
    async fn stage(
        &self,
        stream: ContentStream<'_>,
        max_bytes: Option<u64>,
    ) -> StorageResult<StagedContent> {
        let staging = self.staging_dir();
        fs::create_dir_all(&staging).await?;
        let tmp_path = staging.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let written = Self::write_staged(&mut file, stream, max_bytes).await;
        drop(file);
        match written {
            Ok((content_hash, size_bytes)) => Ok(StagedContent {
                content_hash,
                size_bytes,
                location: StagedLocation::File(tmp_path),
            }),
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                Err(err)
            }
        }
    }

    async fn commit(&self, staged: StagedContent) -> StorageResult<StoredContent> {
        let StagedContent {
            content_hash,
            size_bytes,
            location,
        } = staged;
        let StagedLocation::File(tmp_path) = location else {
            return Err(foreign_staging());
        };

        let reference = ContentRef::from(content_hash.clone());
        let placed = match self.content_path(&reference) {
            Ok(final_path) => self.place(&tmp_path, &final_path).await,
            Err(err) => Err(err),
        };
        if let Err(err) = placed {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }
        debug!(%reference, size_bytes, "stored content");

        Ok(StoredContent {
            reference,
            content_hash,
            size_bytes,
        })
    }

    async fn retrieve(&self, reference: &ContentRef) -> StorageResult<Bytes> {
        let path = self.content_path(reference)?;
        let data = fs::read(&path)
            .await
            .map_err(|err| not_found_or_io(reference, err))?;
        Ok(Bytes::from(data))
    }

    async fn open(&self, reference: &ContentRef) -> StorageResult<ContentReader> {
        let path = self.content_path(reference)?;
        let file = File::open(&path)
            .await
            .map_err(|err| not_found_or_io(reference, err))?;
        Ok(Box::new(file))
    }

    async fn remove(&self, reference: &ContentRef) -> StorageResult<()> {
        let path = self.content_path(reference)?;
        match fs::remove_file(&path).await {
            Ok(_) => debug!("removed content file {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("content file {} already missing", path.display());
            }
            Err(err) => return Err(StorageError::Io(err)),
        }
        if let Some(parent) = path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    async fn health_check(&self) -> StorageResult<()> {
        fs::create_dir_all(&self.base_path).await?;
        let marker = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&marker, b"readyz").await?;
        let read_back = fs::read(&marker).await;
        let _ = fs::remove_file(&marker).await;
        if read_back? != b"readyz" {
            return Err(StorageError::Io(io::Error::other("readiness marker content mismatch")));
        }
        Ok(())
    }
}

/// In-memory content store.
#[derive(Clone, Debug, Default)]
pub struct MemoryContentStore {
    blobs: Arc<RwLock<HashMap<ContentRef, Bytes>>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn stage(
        &self,
        stream: ContentStream<'_>,
        max_bytes: Option<u64>,
    ) -> StorageResult<StagedContent> {
        let mut buffer = Vec::new();
        let (content_hash, size_bytes) = hash_stream(stream, &mut buffer, max_bytes).await?;
        Ok(StagedContent {
            content_hash,
            size_bytes,
            location: StagedLocation::Memory(Bytes::from(buffer)),
        })
    }

    async fn commit(&self, staged: StagedContent) -> StorageResult<StoredContent> {
        let StagedLocation::Memory(data) = staged.location else {
            return Err(foreign_staging());
        };
        let reference = ContentRef::from(staged.content_hash.clone());
        self.blobs
            .write()
            .await
            .entry(reference.clone())
            .or_insert(data);

        Ok(StoredContent {
            reference,
            content_hash: staged.content_hash,
            size_bytes: staged.size_bytes,
        })
    }

    async fn retrieve(&self, reference: &ContentRef) -> StorageResult<Bytes> {
        self.blobs
            .read()
            .await
            .get(reference)
            .cloned()
            .ok_or_else(|| StorageError::ContentNotFound(reference.to_string()))
    }

    async fn open(&self, reference: &ContentRef) -> StorageResult<ContentReader> {
        let data = self.retrieve(reference).await?;
        Ok(Box::new(io::Cursor::new(data)))
    }

    async fn remove(&self, reference: &ContentRef) -> StorageResult<()> {
        self.blobs.write().await.remove(reference);
        Ok(())
    }

    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::hasher::hash_bytes;
    use futures::stream;
    use tokio::io::AsyncReadExt;

    fn chunked(data: &'static [u8], size: usize) -> ContentStream<'static> {
        stream::iter(
            data.chunks(size)
                .map(|c| Ok(Bytes::from_static(c)))
                .collect::<Vec<_>>(),
        )
        .boxed()
    }

    #[tokio::test]
    async fn fs_round_trip_including_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsContentStore::new(dir.path());

        let payloads: [&[u8]; 3] = [b"", b"hello", &[0, 255, 10, 13, 0]];
        for payload in payloads {
            let reference = store.store(Bytes::copy_from_slice(payload)).await.unwrap();
            assert_eq!(reference.as_str(), hash_bytes(payload).as_str());
            let back = store.retrieve(&reference).await.unwrap();
            assert_eq!(&back[..], payload);
        }
    }

    #[tokio::test]
    async fn fs_stream_is_hashed_while_written() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsContentStore::new(dir.path());

        let stored = store
            .store_stream(chunked(b"some streamed document body", 4), None)
            .await
            .unwrap();
        assert_eq!(stored.size_bytes, 27);
        assert_eq!(stored.content_hash, hash_bytes(b"some streamed document body"));

        let mut reader = store.open(&stored.reference).await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"some streamed document body");
    }

    #[tokio::test]
    async fn fs_identical_content_is_stored_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsContentStore::new(dir.path());

        let a = store.store(Bytes::from_static(b"same")).await.unwrap();
        let b = store.store(Bytes::from_static(b"same")).await.unwrap();
        assert_eq!(a, b);

        let staging_left = std::fs::read_dir(dir.path().join(".staging")).unwrap().count();
        assert_eq!(staging_left, 0);
    }

    #[tokio::test]
    async fn fs_rejects_oversized_stream_and_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsContentStore::new(dir.path());

        let err = store
            .store_stream(chunked(b"0123456789", 3), Some(5))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ContentTooLarge { limit: 5 }));

        let reference = ContentRef::from(hash_bytes(b"0123456789"));
        assert!(matches!(
            store.retrieve(&reference).await,
            Err(StorageError::ContentNotFound(_))
        ));
        let staging_left = std::fs::read_dir(dir.path().join(".staging")).unwrap().count();
        assert_eq!(staging_left, 0);
    }

    #[tokio::test]
    async fn fs_unknown_or_removed_reference_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsContentStore::new(dir.path());

        let unknown = ContentRef::from(hash_bytes(b"never stored"));
        assert!(matches!(
            store.retrieve(&unknown).await,
            Err(StorageError::ContentNotFound(_))
        ));
        let traversal = ContentRef::new("../../etc/passwd");
        assert!(matches!(
            store.retrieve(&traversal).await,
            Err(StorageError::ContentNotFound(_))
        ));

        let reference = store.store(Bytes::from_static(b"short lived")).await.unwrap();
        store.remove(&reference).await.unwrap();
        store.remove(&reference).await.unwrap();
        assert!(matches!(
            store.retrieve(&reference).await,
            Err(StorageError::ContentNotFound(_))
        ));
        // shard directories are pruned, only the staging dir remains
        let remaining: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(remaining, vec![std::ffi::OsString::from(".staging")]);
    }

    #[tokio::test]
    async fn fs_staged_bytes_are_not_addressable_until_committed() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsContentStore::new(dir.path());

        let staged = store
            .stage(chunked(b"pending body", 5), None)
            .await
            .unwrap();
        let reference = ContentRef::from(staged.content_hash.clone());
        assert!(matches!(
            store.retrieve(&reference).await,
            Err(StorageError::ContentNotFound(_))
        ));

        let stored = store.commit(staged).await.unwrap();
        assert_eq!(stored.reference, reference);
        assert_eq!(&store.retrieve(&reference).await.unwrap()[..], b"pending body");
    }

    #[tokio::test]
    async fn fs_commit_rewrites_bytes_removed_after_staging() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsContentStore::new(dir.path());

        let reference = store.store(Bytes::from_static(b"contended")).await.unwrap();
        let staged = store
            .stage(chunked(b"contended", 4), None)
            .await
            .unwrap();
        // removal also prunes the shard directories the commit needs
        store.remove(&reference).await.unwrap();

        let stored = store.commit(staged).await.unwrap();
        assert_eq!(stored.reference, reference);
        assert_eq!(&store.retrieve(&reference).await.unwrap()[..], b"contended");
        let staging_left = std::fs::read_dir(dir.path().join(".staging")).unwrap().count();
        assert_eq!(staging_left, 0);
    }

    #[tokio::test]
    async fn staged_content_only_commits_to_its_own_store() {
        let dir = tempfile::tempdir().unwrap();
        let fs_store = FsContentStore::new(dir.path());
        let memory = MemoryContentStore::new();

        let staged = memory.stage(chunked(b"elsewhere", 3), None).await.unwrap();
        assert!(matches!(fs_store.commit(staged).await, Err(StorageError::Io(_))));

        let staged = memory.stage(chunked(b"elsewhere", 3), None).await.unwrap();
        assert!(memory.is_empty().await);
        memory.commit(staged).await.unwrap();
        assert_eq!(memory.len().await, 1);
    }

    #[tokio::test]
    async fn fs_health_check_passes_on_writable_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsContentStore::new(dir.path().join("objects"));
        store.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn memory_round_trip_and_limit() {
        let store = MemoryContentStore::new();
        let reference = store.store(Bytes::from_static(b"in memory")).await.unwrap();
        assert_eq!(&store.retrieve(&reference).await.unwrap()[..], b"in memory");
        assert_eq!(store.len().await, 1);

        let err = store
            .store_stream(chunked(b"too big for the limit", 5), Some(8))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ContentTooLarge { limit: 8 }));
        assert_eq!(store.len().await, 1);

        store.remove(&reference).await.unwrap();
        assert!(store.is_empty().await);
    }
}
