//! Represents an object (file) stored in a bucket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Represents a single object (blob) within a bucket.
///
/// The `Object` struct stores its metadata, not the actual content bytes.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Object {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Foreign key linking to the parent bucket.
    pub bucket_id: Uuid,

    /// Object key (path-like identifier within the bucket).
    pub key: String,

    /// Last path segment of the key.
    pub filename: String,

    /// Content type (MIME type).
    pub content_type: Option<String>,

    /// Size in bytes.
    pub size_bytes: i64,

    /// Lowercase hex MD5 of the payload.
    pub etag: Option<String>,

    /// CRC-64/XZ of the payload, decimal, as reported in `x-cos-hash-crc64ecma`.
    pub crc64: Option<String>,

    /// Canned ACL (e.g. "default", "private", "public-read").
    pub acl: String,

    /// Storage class (e.g., STANDARD, STANDARD_IA).
    pub storage_class: String,

    /// Timestamp when object was last modified.
    pub last_modified: DateTime<Utc>,

    /// Whether the object is marked as deleted (soft delete / delete marker).
    pub is_deleted: bool,
}
