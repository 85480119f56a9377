//! Represents a logical bucket, a top-level container for objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A storage bucket in the local COS-compatible store.
///
/// Buckets are pinned to a single region; every object request names both
/// and a mismatch is rejected.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Bucket {
    /// Unique identifier for this bucket (UUID for internal DB use).
    pub id: Uuid,

    /// Globally unique bucket name (must conform to DNS naming rules).
    pub name: String,

    /// ID of the account that owns this bucket; reported as the ACL owner.
    pub owner_id: Uuid,

    /// Region where the bucket is hosted (e.g. "ap-guangzhou").
    pub region: String,

    /// When this bucket was created.
    pub created_at: DateTime<Utc>,
}
