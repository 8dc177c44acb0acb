use crate::services::storage_service::StorageError;
use thiserror::Error;

/// Terminal failure of a thumbnail invocation. None of these are retried
/// here; they are handed back to whatever delivered the finalize event.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source object `{key}` not found in bucket `{bucket}`")]
    NotFound { bucket: String, key: String },
    #[error("source object failed integrity validation: {0}")]
    Integrity(StorageError),
    #[error("failed to read source object: {0}")]
    Read(StorageError),
    #[error("failed to decode source image: {0}")]
    Decode(String),
    #[error("failed to encode thumbnail: {0}")]
    Encode(String),
    #[error("failed to write thumbnail: {0}")]
    Write(StorageError),
}

impl PipelineError {
    /// Classify a failure to open or validate the source object.
    pub fn from_read(err: StorageError) -> Self {
        match err {
            StorageError::ObjectNotFound { bucket, key } => Self::NotFound { bucket, key },
            err @ StorageError::IntegrityMismatch { .. } => Self::Integrity(err),
            other => Self::Read(other),
        }
    }

    /// Short machine-readable label used in logs and HTTP bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::Integrity(_) => "integrity",
            Self::Read(_) => "read",
            Self::Decode(_) => "decode",
            Self::Encode(_) => "encode",
            Self::Write(_) => "write",
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
