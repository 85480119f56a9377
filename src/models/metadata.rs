//! Stored headers attached to an object.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// One persisted header of an object.
///
/// Holds custom metadata (`x-cos-meta-*`) and the standard headers a client
/// may set on upload or copy (`cache-control`, `content-disposition`, ...).
/// Content type lives on the object row itself.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ObjectMetadata {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Reference to the associated object.
    pub object_id: Uuid,

    /// Lowercased header name (e.g., "x-cos-meta-author").
    pub key: String,

    /// Header value as plain text.
    pub value: String,
}
