//! In-memory `ObjectStore` double for engine tests.

use crate::models::cos::{
    AclParams, CopyObjectRequest, CopyObjectResult, DeleteResult, Grant, HeadObject, Headers,
    ObjectAcl, Owner, Tag,
};
use crate::services::{
    error::{StoreError, StoreResult},
    store::{ByteStream, ObjectStore},
};
use async_trait::async_trait;
use bytes::Bytes;
use crc::{CRC_64_XZ, Crc};
use futures::{StreamExt, stream};
use std::{
    collections::{HashMap, HashSet},
    ops::Range,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

const LAST_MODIFIED: &str = "Tue, 02 Jan 2024 03:04:05 GMT";

struct MockObject {
    headers: Headers,
    body: Bytes,
    tags: Vec<Tag>,
    acl: AclParams,
}

#[derive(Default)]
pub struct MockStore {
    objects: Mutex<HashMap<String, MockObject>>,
    calls: Mutex<HashMap<&'static str, usize>>,
    copies: Mutex<Vec<CopyObjectRequest>>,
    tag_writes: Mutex<Vec<(String, Vec<Tag>)>>,
    deletes: Mutex<Vec<String>>,
    failures: Mutex<HashMap<(&'static str, String), u32>>,
    head_delays: Mutex<HashMap<String, Duration>>,
    hanging: Mutex<HashSet<String>>,
    active_heads: AtomicUsize,
    max_active_heads: AtomicUsize,
}

fn id(bucket: &str, region: &str, key: &str) -> String {
    format!("{bucket}/{region}/{key}")
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_object(&self, bucket: &str, region: &str, key: &str, body: &[u8]) {
        let crc = Crc::<u64>::new(&CRC_64_XZ).checksum(body);
        let mut headers = Headers::new();
        headers.insert("content-type".into(), "application/octet-stream".into());
        headers.insert("content-length".into(), body.len().to_string());
        headers.insert("etag".into(), format!("\"{:x}\"", md5::compute(body)));
        headers.insert("last-modified".into(), LAST_MODIFIED.into());
        headers.insert("date".into(), LAST_MODIFIED.into());
        headers.insert("server".into(), "mock-cos".into());
        headers.insert("x-cos-request-id".into(), "mock-request".into());
        headers.insert("x-cos-hash-crc64ecma".into(), crc.to_string());
        self.objects.lock().unwrap().insert(
            id(bucket, region, key),
            MockObject {
                headers,
                body: Bytes::copy_from_slice(body),
                tags: Vec::new(),
                acl: AclParams::default(),
            },
        );
    }

    fn with_object(&self, bucket: &str, region: &str, key: &str, f: impl FnOnce(&mut MockObject)) {
        let mut objects = self.objects.lock().unwrap();
        f(objects.get_mut(&id(bucket, region, key)).expect("object exists"));
    }

    pub fn set_header(&self, bucket: &str, region: &str, key: &str, name: &str, value: &str) {
        self.with_object(bucket, region, key, |o| {
            o.headers.insert(name.to_ascii_lowercase(), value.to_string());
        });
    }

    pub fn remove_header(&self, bucket: &str, region: &str, key: &str, name: &str) {
        self.with_object(bucket, region, key, |o| {
            o.headers.remove(name);
        });
    }

    pub fn set_tags(&self, bucket: &str, region: &str, key: &str, tags: Vec<Tag>) {
        self.with_object(bucket, region, key, |o| o.tags = tags);
    }

    pub fn set_acl(&self, bucket: &str, region: &str, key: &str, acl: AclParams) {
        self.with_object(bucket, region, key, |o| o.acl = acl);
    }

    /// The `x-cos-hash-crc64ecma` value reported for an object.
    pub fn crc64(&self, bucket: &str, region: &str, key: &str) -> String {
        self.objects.lock().unwrap()[&id(bucket, region, key)].headers["x-cos-hash-crc64ecma"].clone()
    }

    /// Make the next `times` calls of `op` on `key` fail.
    pub fn fail(&self, op: &'static str, key: &str, times: u32) {
        self.failures.lock().unwrap().insert((op, key.to_string()), times);
    }

    pub fn delay_head(&self, key: &str, delay: Duration) {
        self.head_delays.lock().unwrap().insert(key.to_string(), delay);
    }

    /// Bodies of `key` yield nothing and never end.
    pub fn hang_body(&self, key: &str) {
        self.hanging.lock().unwrap().insert(key.to_string());
    }

    pub fn calls(&self, op: &str) -> usize {
        self.calls.lock().unwrap().get(op).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    pub fn copies(&self) -> Vec<CopyObjectRequest> {
        self.copies.lock().unwrap().clone()
    }

    pub fn tag_writes(&self) -> Vec<(String, Vec<Tag>)> {
        self.tag_writes.lock().unwrap().clone()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.deletes.lock().unwrap().clone()
    }

    pub fn max_concurrent_heads(&self) -> usize {
        self.max_active_heads.load(Ordering::SeqCst)
    }

    fn record(&self, op: &'static str, key: &str) -> StoreResult<()> {
        *self.calls.lock().unwrap().entry(op).or_default() += 1;
        let mut failures = self.failures.lock().unwrap();
        if let Some(remaining) = failures.get_mut(&(op, key.to_string())) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StoreError::Request(format!("injected {op} failure for {key}")));
            }
        }
        Ok(())
    }

    fn object<T>(
        &self,
        bucket: &str,
        region: &str,
        key: &str,
        f: impl FnOnce(&MockObject) -> T,
    ) -> StoreResult<T> {
        self.objects
            .lock()
            .unwrap()
            .get(&id(bucket, region, key))
            .map(f)
            .ok_or_else(|| StoreError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }
}

#[async_trait]
impl ObjectStore for MockStore {
    async fn head_object(&self, bucket: &str, region: &str, key: &str) -> StoreResult<HeadObject> {
        self.record("head_object", key)?;
        let active = self.active_heads.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_heads.fetch_max(active, Ordering::SeqCst);
        let delay = self.head_delays.lock().unwrap().get(key).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.active_heads.fetch_sub(1, Ordering::SeqCst);
        self.object(bucket, region, key, |o| HeadObject::new(o.headers.clone()))
    }

    fn get_object_signed_url(
        &self,
        bucket: &str,
        region: &str,
        key: &str,
        _expires: Duration,
    ) -> StoreResult<String> {
        Ok(format!("mock://{}?signed", id(bucket, region, key)))
    }

    fn get_object_unsigned_url(&self, bucket: &str, region: &str, key: &str) -> String {
        format!("mock://{}", id(bucket, region, key))
    }

    async fn get_object_acl(&self, bucket: &str, region: &str, key: &str) -> StoreResult<ObjectAcl> {
        self.record("get_object_acl", key)?;
        self.object(bucket, region, key, |o| ObjectAcl {
            owner: Owner {
                id: "owner".into(),
                display_name: "owner".into(),
            },
            grants: vec![Grant {
                grantee: "owner".into(),
                permission: "FULL_CONTROL".into(),
            }],
            params: o.acl.clone(),
            request_id: Some("mock-request".into()),
        })
    }

    async fn get_object_tagging(&self, bucket: &str, region: &str, key: &str) -> StoreResult<Vec<Tag>> {
        self.record("get_object_tagging", key)?;
        self.object(bucket, region, key, |o| o.tags.clone())
    }

    async fn put_object_tagging(
        &self,
        bucket: &str,
        region: &str,
        key: &str,
        tags: &[Tag],
    ) -> StoreResult<()> {
        self.record("put_object_tagging", key)?;
        self.object(bucket, region, key, |_| ())?;
        self.with_object(bucket, region, key, |o| o.tags = tags.to_vec());
        self.tag_writes.lock().unwrap().push((key.to_string(), tags.to_vec()));
        Ok(())
    }

    async fn copy_object(&self, request: CopyObjectRequest) -> StoreResult<CopyObjectResult> {
        self.record("copy_object", &request.key)?;
        let source_id = request.copy_source.trim_start_matches("mock://").to_string();
        let mut objects = self.objects.lock().unwrap();
        let source = objects.get(&source_id).ok_or_else(|| StoreError::InvalidUrl(request.copy_source.clone()))?;
        let mut headers = request.headers.clone();
        headers.insert("last-modified".into(), LAST_MODIFIED.into());
        if let Some(crc) = source.headers.get("x-cos-hash-crc64ecma") {
            headers.insert("x-cos-hash-crc64ecma".into(), crc.clone());
        }
        let copy = MockObject {
            headers,
            body: source.body.clone(),
            tags: Vec::new(),
            acl: request.acl.clone(),
        };
        objects.insert(id(&request.bucket, &request.region, &request.key), copy);
        drop(objects);
        self.copies.lock().unwrap().push(request);
        Ok(CopyObjectResult {
            etag: "\"mock\"".into(),
            last_modified: LAST_MODIFIED.into(),
        })
    }

    async fn delete_object(&self, bucket: &str, region: &str, key: &str) -> StoreResult<DeleteResult> {
        self.record("delete_object", key)?;
        self.objects.lock().unwrap().remove(&id(bucket, region, key));
        self.deletes.lock().unwrap().push(key.to_string());
        Ok(DeleteResult {
            status_code: 204,
            request_id: Some("mock-request".into()),
        })
    }

    async fn open_range_read(&self, url: &str, range: Option<Range<u64>>) -> StoreResult<ByteStream> {
        let object_id = url
            .strip_prefix("mock://")
            .and_then(|rest| rest.strip_suffix("?signed"))
            .ok_or_else(|| StoreError::AccessDenied(url.to_string()))?;
        let key = object_id.splitn(3, '/').nth(2).unwrap_or_default().to_string();
        self.record("open_range_read", &key)?;

        if self.hanging.lock().unwrap().contains(&key) {
            return Ok(stream::pending().boxed());
        }
        let body = self
            .objects
            .lock()
            .unwrap()
            .get(object_id)
            .map(|o| o.body.clone())
            .ok_or_else(|| StoreError::InvalidUrl(url.to_string()))?;
        let body = match range {
            Some(range) => body.slice(range.start as usize..(range.end as usize).min(body.len())),
            None => body,
        };
        // Small chunks, so the hashing stage sees more than one.
        let chunks: Vec<std::io::Result<Bytes>> = body
            .chunks(4)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }
}
