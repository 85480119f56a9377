use std::{io, sync::Arc};
use thiserror::Error;

/// Failures reported by an `ObjectStore`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("bucket `{0}` already exists")]
    BucketAlreadyExists(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("region `{0}` is not supported")]
    UnsupportedRegion(String),
    #[error("bucket `{bucket}` is in region `{actual}`, not `{requested}`")]
    RegionMismatch {
        bucket: String,
        requested: String,
        actual: String,
    },
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error("malformed object url `{0}`")]
    InvalidUrl(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Failures of a single rename task.
#[derive(Debug, Error)]
pub enum RenameError {
    /// The run was canceled. Every observer of one cancellation shares the
    /// same reason allocation.
    #[error("task canceled: {0}")]
    Canceled(Arc<str>),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("object `{0}` has no parseable last-modified header")]
    InvalidLastModified(String),
    #[error("unknown timezone `{0}`")]
    UnknownTimezone(String),
    #[error("hash stream for `{0}` ended without producing digests")]
    HashIncomplete(String),
}

impl RenameError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, RenameError::Canceled(_))
    }
}

pub type RenameResult<T> = Result<T, RenameError>;
