//! Resolves the three addressing modes of a version: latest by name,
//! zero-based revision index by name, and content hash.

use crate::{
    models::{owner::Owner, version::Version},
    services::{
        hasher::ContentHash,
        ledger::VersionLedger,
        storage_service::{StorageError, StorageResult},
    },
};

#[derive(Clone)]
pub struct LookupService {
    ledger: VersionLedger,
}

impl LookupService {
    pub fn new(ledger: VersionLedger) -> Self {
        Self { ledger }
    }

    /// Latest version when `revision` is absent, otherwise the version at that
    /// zero-based index. A revision that is not an integer is simply not found.
    pub async fn by_path(
        &self,
        owner: &Owner,
        name: &str,
        revision: Option<&str>,
    ) -> StorageResult<Version> {
        let Some(raw) = revision else {
            return self.ledger.get_latest(owner, name).await;
        };
        let index = raw
            .trim()
            .parse::<i64>()
            .map_err(|_| StorageError::RevisionNotFound {
                name: name.to_string(),
                revision: raw.to_string(),
            })?;
        self.ledger.get_version(owner, name, index).await
    }

    /// The owner's version with this content hash.
    ///
    /// The hash must be 64 hex characters; case is ignored.
    pub async fn by_content_hash(&self, owner: &Owner, raw_hash: &str) -> StorageResult<Version> {
        let hash = ContentHash::parse(raw_hash)?;
        self.ledger.find_by_hash(owner, &hash).await
    }
}
