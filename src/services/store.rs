//! The object-store operations the rename pipeline consumes.

use crate::models::cos::{
    CopyObjectRequest, CopyObjectResult, DeleteResult, HeadObject, ObjectAcl, Tag,
};
use crate::services::error::StoreResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::{io, ops::Range, time::Duration};

/// A streamed object body.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Low-level COS operations, implemented by each backend.
///
/// URL generation is local (no I/O); everything else is a network call in a
/// real client and a suspension point for the caller.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch object headers.
    async fn head_object(&self, bucket: &str, region: &str, key: &str) -> StoreResult<HeadObject>;

    /// A time-limited URL that `open_range_read` accepts.
    fn get_object_signed_url(
        &self,
        bucket: &str,
        region: &str,
        key: &str,
        expires: Duration,
    ) -> StoreResult<String>;

    /// A plain URL identifying the object, used as a copy source.
    fn get_object_unsigned_url(&self, bucket: &str, region: &str, key: &str) -> String;

    async fn get_object_acl(&self, bucket: &str, region: &str, key: &str) -> StoreResult<ObjectAcl>;

    async fn get_object_tagging(&self, bucket: &str, region: &str, key: &str)
    -> StoreResult<Vec<Tag>>;

    async fn put_object_tagging(
        &self,
        bucket: &str,
        region: &str,
        key: &str,
        tags: &[Tag],
    ) -> StoreResult<()>;

    /// Server-side copy; the payload never passes through the caller.
    async fn copy_object(&self, request: CopyObjectRequest) -> StoreResult<CopyObjectResult>;

    async fn delete_object(&self, bucket: &str, region: &str, key: &str)
    -> StoreResult<DeleteResult>;

    /// Stream the bytes behind a signed URL, optionally limited to a byte range.
    ///
    /// Dropping the returned stream abandons the read.
    async fn open_range_read(&self, url: &str, range: Option<Range<u64>>)
    -> StoreResult<ByteStream>;
}
