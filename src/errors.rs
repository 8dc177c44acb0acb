use crate::services::{storage_service::StorageError, thumbnail::PipelineError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// HTTP-facing error: a status plus a message rendered as JSON.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    /// Machine-readable classification, when one exists.
    pub kind: Option<&'static str>,
}

impl AppError {
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
            kind: None,
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    fn with_kind(mut self, kind: &'static str) -> Self {
        self.kind = Some(kind);
        self
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
        if let Some(kind) = self.kind {
            body["kind"] = json!(kind);
        }

        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        let status = match &err {
            StorageError::BucketNotFound(_) | StorageError::ObjectNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            StorageError::BucketAlreadyExists(_) => StatusCode::CONFLICT,
            StorageError::InvalidBucketName { .. }
            | StorageError::UnsupportedRegion(_)
            | StorageError::InvalidObjectKey
            | StorageError::Unsupported(_) => StatusCode::BAD_REQUEST,
            StorageError::IntegrityMismatch { .. }
            | StorageError::Sqlx(_)
            | StorageError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "storage operation failed");
        }
        AppError::new(status, err.to_string())
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        let status = match &err {
            PipelineError::NotFound { .. } => StatusCode::NOT_FOUND,
            PipelineError::Decode(_) => StatusCode::UNPROCESSABLE_ENTITY,
            PipelineError::Integrity(_)
            | PipelineError::Read(_)
            | PipelineError::Encode(_)
            | PipelineError::Write(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError::new(status, err.to_string()).with_kind(err.kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_map_to_statuses() {
        let missing: AppError = StorageError::ObjectNotFound {
            bucket: "b".into(),
            key: "k".into(),
        }
        .into();
        assert_eq!(missing.status, StatusCode::NOT_FOUND);

        let taken: AppError = StorageError::BucketAlreadyExists("b".into()).into();
        assert_eq!(taken.status, StatusCode::CONFLICT);

        let bad_key: AppError = StorageError::InvalidObjectKey.into();
        assert_eq!(bad_key.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn pipeline_errors_carry_kind() {
        let decode: AppError = PipelineError::Decode("bad header".into()).into();
        assert_eq!(decode.status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(decode.kind, Some("decode"));

        let write: AppError =
            PipelineError::Write(StorageError::Unsupported("resumable uploads")).into();
        assert_eq!(write.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(write.kind, Some("write"));
    }
}
