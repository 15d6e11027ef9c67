//! Demo data: one user and a handful of documents, each at version 1.

use crate::{
    models::{owner::Owner, version::Version},
    services::storage_service::{StorageResult, StorageService},
};
use bytes::Bytes;
use tracing::info;

pub const FIXTURE_USER_EMAIL: &str = "user1@example.com";

pub const FIXTURE_DOCUMENTS: [&str; 4] = [
    "bill_document",
    "amendment_document",
    "act_document",
    "statute_document",
];

#[derive(Debug)]
pub struct FixtureReport {
    pub owner: Owner,
    /// Set only when the fixture user was created by this run.
    pub token: Option<String>,
    pub created: Vec<Version>,
}

/// Seed the fixture user and documents. Documents that already exist are
/// left alone, so running this twice is harmless.
pub async fn load_fixtures(service: &StorageService) -> StorageResult<FixtureReport> {
    let (owner, token) = match service.access.find_user_by_email(FIXTURE_USER_EMAIL).await? {
        Some(user) => (Owner::from(user), None),
        None => {
            let (user, token) = service.access.create_user(FIXTURE_USER_EMAIL).await?;
            (Owner::from(user), Some(token))
        }
    };

    let mut created = Vec::new();
    for name in FIXTURE_DOCUMENTS {
        match service.ledger.find_file(&owner, name).await {
            Ok(_) => continue,
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
        let body = Bytes::from(format!("{name}\n"));
        let version = service
            .upload_version(&owner, name, Some("text/plain".into()), body)
            .await?;
        created.push(version);
    }

    info!(
        owner = %owner.email,
        created = created.len(),
        "loaded file fixtures"
    );
    Ok(FixtureReport {
        owner,
        token,
        created,
    })
}
