use crate::services::media_store::StoreError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// Outcome of a failed upload job.
///
/// Everything except `InternalFailure` is caused by the uploaded content and
/// is safe to show to the uploader verbatim.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("file too large")]
    TooLarge,
    #[error("could not read uploaded file")]
    ReadFailure(#[source] std::io::Error),
    #[error("file type not supported")]
    UnsupportedFormat,
    #[error("file has no audio or video tracks")]
    NoMediaTracks,
    #[error("file is corrupted")]
    CorruptedSource,
    #[error("smile name already used on this board")]
    SmileNameTaken,
    #[error("internal server error")]
    InternalFailure(#[source] anyhow::Error),
}

impl UploadError {
    /// Wrap an operational failure, logging the cause since the caller never sees it.
    pub fn hide(err: impl Into<anyhow::Error>) -> Self {
        let err = err.into();
        tracing::error!(error = ?err, "upload failed");
        UploadError::InternalFailure(err)
    }

    pub fn status(&self) -> StatusCode {
        match self {
            UploadError::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            UploadError::ReadFailure(_) => StatusCode::BAD_REQUEST,
            UploadError::UnsupportedFormat => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            UploadError::NoMediaTracks | UploadError::CorruptedSource => StatusCode::BAD_REQUEST,
            UploadError::SmileNameTaken => StatusCode::CONFLICT,
            UploadError::InternalFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
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
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        AppError::new(err.status(), err.to_string())
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidDigest | StoreError::TokenNotFound | StoreError::PostNotFound => {
                AppError::not_found(err.to_string())
            }
            StoreError::SmileNameTaken => AppError::new(StatusCode::CONFLICT, err.to_string()),
            other => {
                tracing::error!(error = %other, "storage failure");
                AppError::internal("internal server error")
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!(error = ?err, "request failed");
        AppError::internal("internal server error")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_failure_hides_cause() {
        let err = UploadError::hide(anyhow::anyhow!("disk /srv/assets is full"));
        let app: AppError = err.into();
        assert_eq!(app.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!app.message.contains("disk"));
    }

    #[test]
    fn caller_errors_keep_their_message() {
        let app: AppError = UploadError::UnsupportedFormat.into();
        assert_eq!(app.status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(app.message, "file type not supported");

        let app: AppError = UploadError::TooLarge.into();
        assert_eq!(app.status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn missing_token_or_post_is_not_found() {
        let app: AppError = StoreError::TokenNotFound.into();
        assert_eq!(app.status, StatusCode::NOT_FOUND);
        let app: AppError = StoreError::PostNotFound.into();
        assert_eq!(app.status, StatusCode::NOT_FOUND);
        assert_eq!(app.message, "post not found");
    }
}
