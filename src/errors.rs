use crate::{backends::BackendError, services::registry::ConfigError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use thiserror::Error;
use tracing::error;

/// Failure of a placement or multipart operation.
#[derive(Debug, Error)]
pub enum PlacementError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),
    #[error("location constraint `{0}` is not valid")]
    InvalidLocationConstraint(String),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    InvalidPart(String),
    #[error("parts must be listed in ascending order")]
    InvalidPartOrder,
    #[error("content MD5 does not match the received payload")]
    BadDigest,
    #[error("requested range is not satisfiable")]
    InvalidRange,
    #[error("upload `{0}` does not exist")]
    NoSuchUpload(String),
    #[error("bucket `{0}` not found")]
    NoSuchBucket(String),
    #[error("object `{key}` not found in bucket `{bucket}`")]
    NoSuchKey { bucket: String, key: String },
    #[error("object `{key}` in bucket `{bucket}` changed during the operation")]
    RecordChanged { bucket: String, key: String },
    #[error("bucket `{0}` already exists")]
    BucketAlreadyExists(String),
    #[error("bucket `{0}` is not empty")]
    BucketNotEmpty(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error("{operation} on location `{location}` failed: {source}")]
    Backend {
        operation: &'static str,
        location: String,
        #[source]
        source: BackendError,
    },
    #[error(transparent)]
    Metadata(#[from] sqlx::Error),
}

pub type PlacementResult<T> = Result<T, PlacementError>;

impl PlacementError {
    pub fn backend(operation: &'static str, location: impl Into<String>, source: BackendError) -> Self {
        Self::Backend {
            operation,
            location: location.into(),
            source,
        }
    }

    /// Stable error code reported to callers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) | Self::Metadata(_) => "InternalError",
            Self::InvalidLocationConstraint(_) => "InvalidLocationConstraint",
            Self::InvalidArgument(_) | Self::InvalidObjectKey => "InvalidArgument",
            Self::InvalidPart(_) => "InvalidPart",
            Self::InvalidPartOrder => "InvalidPartOrder",
            Self::BadDigest => "BadDigest",
            Self::InvalidRange => "InvalidRange",
            Self::NoSuchUpload(_) => "NoSuchUpload",
            Self::NoSuchBucket(_) => "NoSuchBucket",
            Self::NoSuchKey { .. } => "NoSuchKey",
            Self::RecordChanged { .. } => "OperationAborted",
            Self::BucketAlreadyExists(_) => "BucketAlreadyExists",
            Self::BucketNotEmpty(_) => "BucketNotEmpty",
            Self::InvalidBucketName { .. } => "InvalidBucketName",
            Self::Backend { .. } => "ServiceUnavailable",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Configuration(_) | Self::Metadata(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::InvalidLocationConstraint(_)
            | Self::InvalidArgument(_)
            | Self::InvalidObjectKey
            | Self::InvalidPart(_)
            | Self::InvalidPartOrder
            | Self::BadDigest
            | Self::InvalidBucketName { .. } => StatusCode::BAD_REQUEST,
            Self::InvalidRange => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::NoSuchUpload(_) | Self::NoSuchBucket(_) | Self::NoSuchKey { .. } => {
                StatusCode::NOT_FOUND
            }
            Self::BucketAlreadyExists(_) | Self::BucketNotEmpty(_) | Self::RecordChanged { .. } => {
                StatusCode::CONFLICT
            }
            Self::Backend { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, code: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: msg.into(),
        }
    }

    /// Shortcut for 400 InvalidArgument
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "InvalidArgument", msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "code": self.code,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<PlacementError> for AppError {
    fn from(err: PlacementError) -> Self {
        let status = err.status();
        let code = err.code();
        // internal detail stays in the log
        let message = match &err {
            PlacementError::Configuration(_) => {
                error!(error = %err, "fatal placement configuration error");
                "internal configuration error".to_string()
            }
            PlacementError::Metadata(_) => {
                error!(error = %err, "metadata store failure");
                "internal error".to_string()
            }
            PlacementError::Backend { .. } => {
                error!(error = %err, "backend failure");
                "storage backend unavailable".to_string()
            }
            _ => err.to_string(),
        };
        Self::new(status, code, message)
    }
}
