//! Content fingerprinting.
//!
//! Every version carries the SHA-256 of its bytes, rendered as 64 lowercase
//! hex characters. The same digest doubles as the content store reference.

use crate::services::storage_service::{StorageError, StorageResult};
use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{fmt, io};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Length of a rendered digest.
pub const CONTENT_HASH_HEX_LEN: usize = 64;

/// A validated, lowercase SHA-256 hex digest.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Parse user input into a digest.
    ///
    /// Accepts exactly 64 hex characters in either case and normalizes to
    /// lowercase, which is the only form ever stored.
    pub fn parse(raw: &str) -> StorageResult<Self> {
        if raw.len() != CONTENT_HASH_HEX_LEN || !raw.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidContentHash(raw.to_string()));
        }
        Ok(Self(raw.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Incremental SHA-256 over arbitrarily sized chunks.
#[derive(Clone, Default)]
pub struct ContentHasher {
    inner: Sha256,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
    }

    pub fn finalize(self) -> ContentHash {
        ContentHash(hex::encode(self.inner.finalize()))
    }
}

/// Hash a complete buffer.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
    let mut hasher = ContentHasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Copy `stream` into `sink`, hashing every chunk on the way through.
///
/// Returns the digest and the number of bytes copied. Stops with
/// [`StorageError::ContentTooLarge`] once more than `max_bytes` have been read.
pub async fn hash_stream<S, W>(
    stream: S,
    sink: &mut W,
    max_bytes: Option<u64>,
) -> StorageResult<(ContentHash, u64)>
where
    S: Stream<Item = io::Result<Bytes>>,
    W: AsyncWrite + Unpin,
{
    let mut hasher = ContentHasher::new();
    let mut size_bytes: u64 = 0;
    pin_mut!(stream);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        size_bytes += chunk.len() as u64;
        if let Some(limit) = max_bytes {
            if size_bytes > limit {
                return Err(StorageError::ContentTooLarge { limit });
            }
        }
        hasher.update(&chunk);
        sink.write_all(&chunk).await?;
    }
    sink.flush().await?;
    Ok((hasher.finalize(), size_bytes))
}
