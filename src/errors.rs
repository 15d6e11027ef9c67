use crate::services::storage_service::StorageError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

const INTERNAL_MESSAGE: &str =
    "An unexpected error occurred. Please contact support if the problem persists.";

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    /// Request field a validation error refers to.
    pub field: Option<&'static str>,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
            field: None,
        }
    }

    /// Shortcut for a 500 Internal Server Error.
    ///
    /// The detail is logged here and replaced by a generic message.
    pub fn internal(msg: impl Into<String>) -> Self {
        tracing::error!(error = %msg.into(), "internal server error");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_MESSAGE)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    /// Shortcut for a 400 Bad Request tied to one field.
    pub fn validation(field: &'static str, msg: impl Into<String>) -> Self {
        Self {
            field: Some(field),
            ..Self::new(StatusCode::BAD_REQUEST, msg)
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": self.message,
            "status": self.status.as_u16()
        });
        if let Some(field) = self.field {
            body[field] = json!([self.message]);
            body["field"] = json!(field);
        }

        let mut response = (self.status, Json(body)).into_response();
        if self.status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                axum::http::header::WWW_AUTHENTICATE,
                axum::http::HeaderValue::from_static("Token"),
            );
        }
        response
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        if let Some(field) = err.field() {
            return AppError::validation(field, err.to_string());
        }
        if err.is_not_found() {
            return AppError::not_found(err.to_string());
        }
        match err {
            StorageError::Unauthenticated => AppError::new(StatusCode::UNAUTHORIZED, err.to_string()),
            StorageError::UserAlreadyExists(_) => AppError::new(StatusCode::CONFLICT, err.to_string()),
            other => AppError::internal(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_map_to_statuses() {
        let cases = [
            (StorageError::EmptyContent, StatusCode::BAD_REQUEST),
            (
                StorageError::InvalidFileName {
                    reason: "is required".into(),
                },
                StatusCode::BAD_REQUEST,
            ),
            (StorageError::InvalidContentHash("x".into()), StatusCode::BAD_REQUEST),
            (StorageError::VersionNotFound("x".into()), StatusCode::NOT_FOUND),
            (StorageError::FileNotFound("x".into()), StatusCode::NOT_FOUND),
            (StorageError::Unauthenticated, StatusCode::UNAUTHORIZED),
            (
                StorageError::AllocationConflict {
                    name: "x".into(),
                    attempts: 5,
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }

    #[test]
    fn internal_errors_hide_detail() {
        let err = AppError::from(StorageError::Io(std::io::Error::other("disk on fire at /var/x")));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.message.contains("disk on fire"));
    }

    #[test]
    fn validation_errors_name_the_field() {
        let err = AppError::from(StorageError::EmptyContent);
        assert_eq!(err.field, Some("file"));
        assert!(err.message.contains("empty"));
    }
}
