//! Request authentication.
//!
//! Handlers take an [`Owner`] argument; extraction fails with 401 unless the
//! request carries `Authorization: Token <token>` for a known user.

use crate::{
    errors::AppError,
    models::owner::Owner,
    services::{access::token_from_header, storage_service::{StorageError, StorageService}},
};
use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts},
};

impl FromRequestParts<StorageService> for Owner {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        service: &StorageService,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(token_from_header)
            .ok_or(StorageError::Unauthenticated)?;

        Ok(service.access.authenticate(token).await?)
    }
}
