//! HTTP handlers for file versions.
//! Streams upload and download bodies to avoid buffering in memory and
//! delegates storage concerns to `StorageService`.

use crate::{
    errors::AppError,
    models::{
        owner::Owner,
        version::{Version, VersionUpdate},
    },
    services::{
        ledger::{ListVersionsParams, ListVersionsResult, VersionCursor},
        storage_service::{StorageError, StorageService},
    },
};
use axum::{
    Json,
    body::Body,
    extract::{
        Multipart, Path, Query, State,
        multipart::{Field, MultipartError},
    },
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::io;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

/// Owning logical file as embedded in a version body.
#[derive(Debug, Serialize)]
pub struct FileRef {
    pub id: Uuid,
    pub name: String,
}

/// JSON body describing one version.
#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub id: Uuid,
    pub file_obj: FileRef,
    pub version_number: i64,
    pub content_hash: String,
    pub size_bytes: i64,
    pub content_type: Option<String>,
    pub owner: String,
    pub created_at: DateTime<Utc>,
    pub shareable_link: Option<String>,
}

impl VersionResponse {
    fn new(service: &StorageService, owner: &Owner, version: Version) -> Self {
        let shareable_link = service.shareable_link(&version);
        Self {
            id: version.id,
            file_obj: FileRef {
                id: version.file_id,
                name: version.file_name,
            },
            version_number: version.version_number,
            content_hash: version.content_hash,
            size_bytes: version.size_bytes,
            content_type: version.content_type,
            owner: owner.email.clone(),
            created_at: version.created_at,
            shareable_link,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListVersionsResponse {
    pub results: Vec<VersionResponse>,
    pub is_truncated: bool,
    pub next_cursor: Option<String>,
}

/// Query params accepted by the version listing.
#[derive(Debug, Deserialize)]
pub struct ListVersionsQuery {
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

/// Query params accepted by the by-path lookup.
#[derive(Debug, Deserialize)]
pub struct RevisionQuery {
    pub revision: Option<String>,
}

/// Body of `PATCH /api/file_versions/{id}`.
///
/// Only `content_type` can change. The remaining fields are accepted so that
/// an attempt to change them is reported instead of silently ignored.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateVersionRequest {
    pub content_type: Option<String>,
    pub version_number: Option<serde_json::Value>,
    pub content_hash: Option<serde_json::Value>,
    pub content_ref: Option<serde_json::Value>,
    pub file_name: Option<serde_json::Value>,
    pub file_obj: Option<serde_json::Value>,
    pub file: Option<serde_json::Value>,
}

impl UpdateVersionRequest {
    fn read_only_field(&self) -> Option<&'static str> {
        [
            ("version_number", self.version_number.is_some()),
            ("content_hash", self.content_hash.is_some()),
            ("content_ref", self.content_ref.is_some()),
            ("file_name", self.file_name.is_some()),
            ("file_obj", self.file_obj.is_some()),
            ("file", self.file.is_some()),
        ]
        .into_iter()
        .find_map(|(field, present)| present.then_some(field))
    }
}

/// POST `/api/file_versions`: multipart upload with `file_name` and `file`.
///
/// When `file_name` comes first the `file` part is streamed straight into the
/// store; otherwise it is held until the name is known, so an invalid name
/// never reaches storage.
pub async fn upload_version(
    State(service): State<StorageService>,
    owner: Owner,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let mut file_name: Option<String> = None;
    let mut pending: Option<(Option<String>, Bytes)> = None;
    let mut uploaded: Option<Version> = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let part = field.name().map(str::to_string);
        match part.as_deref() {
            Some("file_name") => {
                file_name = Some(field.text().await.map_err(multipart_error)?);
            }
            Some("file") if uploaded.is_none() && pending.is_none() => {
                let content_type = field.content_type().map(str::to_string);
                match &file_name {
                    Some(name) => {
                        let version = service
                            .upload_version_stream(&owner, name, content_type, field_stream(field))
                            .await?;
                        uploaded = Some(version);
                    }
                    None => {
                        let data = field.bytes().await.map_err(multipart_error)?;
                        pending = Some((content_type, data));
                    }
                }
            }
            _ => {}
        }
    }

    let version = match (uploaded, pending, file_name) {
        (Some(version), _, _) => version,
        (None, Some((content_type, data)), Some(name)) => {
            service
                .upload_version(&owner, &name, content_type, data)
                .await?
        }
        (None, _, None) => return Err(StorageError::MissingField("file_name").into()),
        (None, None, Some(_)) => return Err(StorageError::MissingField("file").into()),
    };

    Ok((
        StatusCode::CREATED,
        Json(VersionResponse::new(&service, &owner, version)),
    ))
}

/// GET `/api/file_versions`: the caller's versions, supports ?limit=&cursor=
pub async fn list_versions(
    State(service): State<StorageService>,
    owner: Owner,
    Query(q): Query<ListVersionsQuery>,
) -> Result<Json<ListVersionsResponse>, AppError> {
    let cursor = q.cursor.as_deref().map(decode_cursor).transpose()?;
    let params = ListVersionsParams {
        limit: q.limit.unwrap_or(ListVersionsParams::default().limit),
        cursor,
    };

    let ListVersionsResult {
        versions,
        is_truncated,
        next_cursor,
    } = service.list_versions(&owner, params).await?;

    Ok(Json(ListVersionsResponse {
        results: versions
            .into_iter()
            .map(|v| VersionResponse::new(&service, &owner, v))
            .collect(),
        is_truncated,
        next_cursor: next_cursor.as_ref().map(encode_cursor),
    }))
}

/// GET `/api/file_versions/{id}`
pub async fn get_version(
    State(service): State<StorageService>,
    owner: Owner,
    Path(id): Path<String>,
) -> Result<Json<VersionResponse>, AppError> {
    let version = service.get_version(&owner, parse_version_id(&id)?).await?;
    Ok(Json(VersionResponse::new(&service, &owner, version)))
}

/// PATCH/PUT `/api/file_versions/{id}`: update mutable metadata.
pub async fn update_version(
    State(service): State<StorageService>,
    owner: Owner,
    Path(id): Path<String>,
    Json(req): Json<UpdateVersionRequest>,
) -> Result<Json<VersionResponse>, AppError> {
    let id = parse_version_id(&id)?;
    // scope check first: someone else's version is simply not found
    service.get_version(&owner, id).await?;
    if let Some(field) = req.read_only_field() {
        return Err(StorageError::ReadOnlyField(field).into());
    }

    let version = service
        .update_version(
            &owner,
            id,
            VersionUpdate {
                content_type: req.content_type,
            },
        )
        .await?;
    Ok(Json(VersionResponse::new(&service, &owner, version)))
}

/// DELETE `/api/file_versions/{id}`
pub async fn delete_version(
    State(service): State<StorageService>,
    owner: Owner,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    service
        .delete_version(&owner, parse_version_id(&id)?)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET `/api/file_versions/{id}/content`: stream the stored bytes.
pub async fn download_content(
    State(service): State<StorageService>,
    owner: Owner,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let (version, reader) = service
        .open_content(&owner, parse_version_id(&id)?)
        .await?;
    let body = Body::from_stream(ReaderStream::new(reader));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_content_headers(response.headers_mut(), &version);
    Ok(response)
}

/// GET `/api/file_versions/{id}/share`
pub async fn share_version(
    State(service): State<StorageService>,
    owner: Owner,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let version = service.get_version(&owner, parse_version_id(&id)?).await?;
    let link = service.shareable_link(&version);
    let status = if link.is_some() {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    Ok((status, Json(serde_json::json!({ "shareable_link": link }))).into_response())
}

/// GET `/api/file_versions/by_hash/{content_hash}`
pub async fn get_by_hash(
    State(service): State<StorageService>,
    owner: Owner,
    Path(content_hash): Path<String>,
) -> Result<Json<VersionResponse>, AppError> {
    let version = service.get_by_content_hash(&owner, &content_hash).await?;
    Ok(Json(VersionResponse::new(&service, &owner, version)))
}

/// GET `/api/files/{name}`: latest version, or ?revision=N (zero-based).
pub async fn get_by_path(
    State(service): State<StorageService>,
    owner: Owner,
    Path(name): Path<String>,
    Query(q): Query<RevisionQuery>,
) -> Result<Json<VersionResponse>, AppError> {
    let version = service
        .get_by_path(&owner, &name, q.revision.as_deref())
        .await?;
    Ok(Json(VersionResponse::new(&service, &owner, version)))
}

/// GET `/api/files/{name}/versions`: every version of one file, ascending.
pub async fn list_file_versions(
    State(service): State<StorageService>,
    owner: Owner,
    Path(name): Path<String>,
) -> Result<Json<Vec<VersionResponse>>, AppError> {
    let versions = service.list_file_versions(&owner, &name).await?;
    Ok(Json(
        versions
            .into_iter()
            .map(|v| VersionResponse::new(&service, &owner, v))
            .collect(),
    ))
}

fn field_stream(field: Field<'_>) -> futures::stream::BoxStream<'_, io::Result<Bytes>> {
    field.map(|chunk| chunk.map_err(io::Error::other)).boxed()
}

fn multipart_error(err: MultipartError) -> AppError {
    AppError::new(err.status(), err.body_text())
}

/// Version ids that do not parse cannot exist.
fn parse_version_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| StorageError::VersionNotFound(raw.to_string()).into())
}

fn set_content_headers(headers: &mut HeaderMap, version: &Version) {
    let content_type = version
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".into());
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );

    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&version.size_bytes.max(0).to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("0")),
    );

    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", version.content_hash)) {
        headers.insert(header::ETAG, value);
    }

    if !version.file_name.contains('"') {
        let disposition = format!("attachment; filename=\"{}\"", version.file_name);
        if let Ok(value) = HeaderValue::from_str(&disposition) {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
    }

    headers.insert(
        header::LAST_MODIFIED,
        HeaderValue::from_str(&version.created_at.to_rfc2822())
            .unwrap_or_else(|_| HeaderValue::from_static("")),
    );
}

fn encode_cursor(cursor: &VersionCursor) -> String {
    general_purpose::URL_SAFE_NO_PAD.encode(format!(
        "{}/{}",
        cursor.file_name, cursor.version_number
    ))
}

/// File names never contain `/`, so the last `/` separates the version number.
fn decode_cursor(token: &str) -> Result<VersionCursor, AppError> {
    let decoded = general_purpose::URL_SAFE_NO_PAD
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or(StorageError::InvalidCursor)?;
    let (file_name, version_number) = decoded.rsplit_once('/').ok_or(StorageError::InvalidCursor)?;
    let version_number = version_number
        .parse::<i64>()
        .map_err(|_| StorageError::InvalidCursor)?;
    Ok(VersionCursor {
        file_name: file_name.to_string(),
        version_number,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_survives_encoding() {
        let cursor = VersionCursor {
            file_name: "report final.txt".into(),
            version_number: 12,
        };
        assert_eq!(decode_cursor(&encode_cursor(&cursor)).unwrap(), cursor);
    }

    #[test]
    fn garbage_cursor_is_a_validation_error() {
        for token in ["%%%", "bm8tc2xhc2g", "YS50eHQveA"] {
            let err = decode_cursor(token).unwrap_err();
            assert_eq!(err.status, StatusCode::BAD_REQUEST, "{token}");
            assert_eq!(err.field, Some("cursor"));
        }
    }

    #[test]
    fn read_only_fields_are_detected() {
        let req = UpdateVersionRequest {
            content_hash: Some(serde_json::json!("00")),
            ..Default::default()
        };
        assert_eq!(req.read_only_field(), Some("content_hash"));

        let req = UpdateVersionRequest {
            content_type: Some("text/plain".into()),
            ..Default::default()
        };
        assert_eq!(req.read_only_field(), None);
    }
}
