//! src/services/storage_service.rs
//!
//! StorageService, a local COS-compatible object store. Metadata lives in
//! SQLite, payloads on disk sharded beneath
//! `base_path/{bucket}/{shard}/{shard}/{key}`. It implements `ObjectStore`,
//! so a rename run can execute end to end without a remote account.

use crate::models::{
    bucket::Bucket,
    cos::{
        AclParams, CopyObjectRequest, CopyObjectResult, DeleteResult, Grant, HeadObject, Headers,
        MetadataDirective, ObjectAcl, Owner, Tag,
    },
    metadata::ObjectMetadata,
    object::Object,
};
use crate::services::{
    error::{StoreError, StoreResult},
    hashing::{HashAlgorithm, MultiHashStream},
    store::{ByteStream, ObjectStore},
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use sqlx::SqlitePool;
use std::{
    io::{self, ErrorKind, SeekFrom},
    ops::Range,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

/// Object URLs are path-style under this host.
const URL_BASE: &str = "http://cos-local/";
const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";
const DEFAULT_ACL: &str = "default";
const DEFAULT_STORAGE_CLASS: &str = "STANDARD";

const OBJECT_COLUMNS: &str = "id, bucket_id, key, filename, content_type, size_bytes, etag, \
                              crc64, acl, storage_class, last_modified, is_deleted";

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;
const SUPPORTED_REGIONS: &[&str] = &[
    "local",
    "ap-beijing",
    "ap-nanjing",
    "ap-shanghai",
    "ap-guangzhou",
    "ap-chengdu",
    "ap-chongqing",
    "ap-shenzhen-fsi",
    "ap-shanghai-fsi",
    "ap-beijing-fsi",
    "ap-hongkong",
    "ap-singapore",
    "ap-mumbai",
    "ap-jakarta",
    "ap-seoul",
    "ap-bangkok",
    "ap-tokyo",
    "na-siliconvalley",
    "na-ashburn",
    "sa-saopaulo",
    "eu-frankfurt",
];

/// Headers the store derives itself. They are never persisted from a request.
const MANAGED_HEADERS: [&str; 11] = [
    "connection",
    "content-length",
    "content-type",
    "date",
    "etag",
    "last-modified",
    "server",
    "x-cos-hash-crc64ecma",
    "x-cos-request-id",
    "x-cos-storage-class",
    "x-cos-tagging-count",
];

/// Everything besides the payload that an upload may set.
#[derive(Clone, Debug, Default)]
pub struct UploadOptions {
    pub content_type: Option<String>,
    /// Headers to store with the object (`x-cos-meta-*`, `cache-control`, ...).
    pub headers: Headers,
    pub tags: Vec<Tag>,
    /// Canned ACL; `default` when absent.
    pub acl: Option<String>,
}

/// Row fields written by an upload or a copy.
struct ObjectRow<'a> {
    content_type: Option<&'a str>,
    size_bytes: i64,
    etag: Option<&'a str>,
    crc64: Option<&'a str>,
    acl: &'a str,
    storage_class: &'a str,
}

/// The parts of an object URL.
#[derive(Debug, PartialEq, Eq)]
struct ObjectLocation {
    region: String,
    bucket: String,
    key: String,
    query: Option<String>,
}

#[derive(Clone)]
pub struct StorageService {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,

    /// Secret used to sign and verify object URLs.
    signing_key: Arc<str>,
}

impl StorageService {
    pub fn new(
        db: Arc<SqlitePool>,
        base_path: impl Into<PathBuf>,
        signing_key: impl Into<String>,
    ) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            signing_key: Arc::from(signing_key.into()),
        }
    }

    /// Create the tables if they do not exist yet.
    pub async fn init_schema(&self) -> StoreResult<usize> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();
        for stmt in &statements {
            debug!("Executing schema SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(statements.len())
    }

    /// Rejects keys that are empty, too long, start with `/`, contain `..`,
    /// `\`, `?` or control characters.
    fn ensure_key_safe(&self, key: &str) -> StoreResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(StoreError::InvalidObjectKey);
        }
        if key.starts_with('/') || key.contains("..") {
            return Err(StoreError::InvalidObjectKey);
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'?')
        {
            return Err(StoreError::InvalidObjectKey);
        }
        Ok(())
    }

    /// Validate bucket name format.
    ///
    /// - 3–63 characters
    /// - lowercase letters, digits, dots, hyphens only
    /// - cannot start/end with dot or hyphen
    /// - cannot contain consecutive dots or dot-hyphen patterns
    /// - cannot look like an IPv4 address
    fn ensure_bucket_name_safe(&self, name: &str) -> StoreResult<()> {
        let invalid = |reason: &str| {
            Err(StoreError::InvalidBucketName {
                name: name.to_string(),
                reason: reason.to_string(),
            })
        };

        if name.len() < BUCKET_NAME_MIN_LEN || name.len() > BUCKET_NAME_MAX_LEN {
            return invalid("must be between 3 and 63 characters");
        }
        if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
        {
            return invalid("allowed characters are lowercase letters, digits, dots, and hyphens");
        }
        if name.starts_with(['.', '-']) || name.ends_with(['.', '-']) {
            return invalid("must start and end with a lowercase letter or digit");
        }
        if name.contains("..") || name.contains("-.") || name.contains(".-") {
            return invalid("cannot contain consecutive dots or dot-hyphen combinations");
        }
        if is_ipv4_like(name) {
            return invalid("must not be formatted like an IP address");
        }
        Ok(())
    }

    fn ensure_region_valid(&self, region: &str) -> StoreResult<()> {
        if SUPPORTED_REGIONS
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(region))
        {
            Ok(())
        } else {
            Err(StoreError::UnsupportedRegion(region.to_string()))
        }
    }

    fn bucket_root(&self, bucket_name: &str) -> PathBuf {
        self.base_path.join(bucket_name)
    }

    /// First two bytes of MD5(bucket/key) as hex, to spread files over
    /// directories.
    fn object_shards(bucket_name: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket_name, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, bucket_name: &str, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(bucket_name, key);
        let mut path = self.bucket_root(bucket_name);
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    /// Look a bucket up by name alone.
    pub async fn bucket(&self, name: &str) -> StoreResult<Bucket> {
        self.ensure_bucket_name_safe(name)?;
        sqlx::query_as::<_, Bucket>(
            "SELECT id, name, owner_id, region, created_at
             FROM buckets WHERE name = ?",
        )
        .bind(name)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StoreError::BucketNotFound(name.to_string()),
            other => StoreError::Sqlx(other),
        })
    }

    /// Look a bucket up and check it lives in `region`.
    async fn fetch_bucket(&self, name: &str, region: &str) -> StoreResult<Bucket> {
        let bucket = self.bucket(name).await?;
        if !bucket.region.eq_ignore_ascii_case(region) {
            return Err(StoreError::RegionMismatch {
                bucket: name.to_string(),
                requested: region.to_string(),
                actual: bucket.region,
            });
        }
        Ok(bucket)
    }

    /// Fetch a non-deleted object row.
    async fn fetch_object(&self, bucket: &Bucket, key: &str) -> StoreResult<Object> {
        let sql = format!(
            "SELECT {OBJECT_COLUMNS} FROM objects
             WHERE key = ? AND bucket_id = ? AND is_deleted = 0"
        );
        sqlx::query_as::<_, Object>(&sql)
            .bind(key)
            .bind(bucket.id)
            .fetch_one(&*self.db)
            .await
            .map_err(|err| match err {
                sqlx::Error::RowNotFound => StoreError::ObjectNotFound {
                    bucket: bucket.name.clone(),
                    key: key.to_string(),
                },
                other => StoreError::Sqlx(other),
            })
    }

    async fn locate(&self, bucket: &str, region: &str, key: &str) -> StoreResult<(Bucket, Object)> {
        self.ensure_key_safe(key)?;
        let bucket = self.fetch_bucket(bucket, region).await?;
        let object = self.fetch_object(&bucket, key).await?;
        Ok((bucket, object))
    }

    /// Insert or overwrite the row for `bucket/key`. An overwrite keeps the
    /// row id and clears the delete flag.
    async fn upsert_object(&self, bucket: &Bucket, key: &str, row: ObjectRow<'_>) -> StoreResult<Object> {
        let filename = key.rsplit('/').next().unwrap_or(key).to_string();
        let sql = format!(
            "INSERT INTO objects (
                id, bucket_id, key, filename, content_type, size_bytes,
                etag, crc64, acl, storage_class, last_modified, is_deleted
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
            ON CONFLICT(bucket_id, key) DO UPDATE SET
                filename = excluded.filename,
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                crc64 = excluded.crc64,
                acl = excluded.acl,
                storage_class = excluded.storage_class,
                last_modified = excluded.last_modified,
                is_deleted = 0
            RETURNING {OBJECT_COLUMNS}"
        );
        let object = sqlx::query_as::<_, Object>(&sql)
            .bind(Uuid::new_v4())
            .bind(bucket.id)
            .bind(key)
            .bind(&filename)
            .bind(row.content_type)
            .bind(row.size_bytes)
            .bind(row.etag)
            .bind(row.crc64)
            .bind(row.acl)
            .bind(row.storage_class)
            .bind(Utc::now())
            .fetch_one(&*self.db)
            .await?;
        Ok(object)
    }

    async fn replace_metadata(&self, object_id: Uuid, headers: &Headers) -> StoreResult<()> {
        sqlx::query("DELETE FROM object_metadata WHERE object_id = ?")
            .bind(object_id)
            .execute(&*self.db)
            .await?;
        for (name, value) in headers {
            let name = name.to_ascii_lowercase();
            if MANAGED_HEADERS.contains(&name.as_str()) {
                continue;
            }
            sqlx::query(
                "INSERT OR REPLACE INTO object_metadata (id, object_id, key, value)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(Uuid::new_v4())
            .bind(object_id)
            .bind(&name)
            .bind(value)
            .execute(&*self.db)
            .await?;
        }
        Ok(())
    }

    async fn load_metadata(&self, object_id: Uuid) -> StoreResult<Vec<ObjectMetadata>> {
        Ok(sqlx::query_as::<_, ObjectMetadata>(
            "SELECT id, object_id, key, value FROM object_metadata
             WHERE object_id = ? ORDER BY key",
        )
        .bind(object_id)
        .fetch_all(&*self.db)
        .await?)
    }

    async fn replace_tags(&self, object_id: Uuid, tags: &[Tag]) -> StoreResult<()> {
        sqlx::query("DELETE FROM object_tags WHERE object_id = ?")
            .bind(object_id)
            .execute(&*self.db)
            .await?;
        for (position, tag) in tags.iter().enumerate() {
            sqlx::query(
                "INSERT OR REPLACE INTO object_tags (object_id, position, key, value)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(object_id)
            .bind(position as i64)
            .bind(&tag.key)
            .bind(&tag.value)
            .execute(&*self.db)
            .await?;
        }
        Ok(())
    }

    async fn load_tags(&self, object_id: Uuid) -> StoreResult<Vec<Tag>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT key, value FROM object_tags WHERE object_id = ? ORDER BY position",
        )
        .bind(object_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(rows.into_iter().map(|(key, value)| Tag::new(key, value)).collect())
    }

    /// Stream-upload an object to disk and upsert its metadata.
    ///
    /// Bytes go to a temporary file while MD5 (the etag) and CRC-64 are
    /// computed in the same pass; the file is then renamed into place.
    pub async fn upload_object_stream<S>(
        &self,
        bucket: &str,
        key: &str,
        options: UploadOptions,
        stream: S,
    ) -> StoreResult<Object>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.bucket(bucket).await?;

        let file_path = self.object_path(&bucket_rec.name, key);
        let parent = file_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| StoreError::Io(io::Error::other("object path missing parent directory")))?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let (mut hashed, digests) = MultiHashStream::new(
            Box::pin(stream),
            &[HashAlgorithm::Md5, HashAlgorithm::Crc64],
        );
        let mut size_bytes: i64 = 0;
        while let Some(chunk_res) = hashed.next().await {
            let written = match chunk_res {
                Ok(chunk) => {
                    size_bytes += chunk.len() as i64;
                    file.write_all(&chunk).await
                }
                Err(err) => Err(err),
            };
            if let Err(err) = written {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::Io(err));
            }
        }
        if let Err(err) = file.flush().await.and(file.sync_all().await) {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        let Ok(digests) = digests.await else {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(io::Error::other("upload ended without digests")));
        };

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&file_path).await?;
                fs::rename(&tmp_path, &file_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::Io(err));
            }
        }

        let crc64 = digests.placeholder_value(HashAlgorithm::Crc64);
        let acl = options.acl.as_deref().unwrap_or(DEFAULT_ACL);
        let object = match self
            .upsert_object(
                &bucket_rec,
                key,
                ObjectRow {
                    content_type: options.content_type.as_deref(),
                    size_bytes,
                    etag: digests.get(HashAlgorithm::Md5),
                    crc64: crc64.as_deref(),
                    acl,
                    storage_class: DEFAULT_STORAGE_CLASS,
                },
            )
            .await
        {
            Ok(object) => object,
            Err(err) => {
                let _ = fs::remove_file(&file_path).await;
                return Err(err);
            }
        };

        self.replace_metadata(object.id, &options.headers).await?;
        self.replace_tags(object.id, &options.tags).await?;
        debug!("stored {}/{} ({} bytes)", bucket, key, size_bytes);
        Ok(object)
    }

    /// Create a bucket in `region` and initialize its directory.
    pub async fn create_bucket(&self, name: &str, region: String) -> StoreResult<Bucket> {
        self.ensure_bucket_name_safe(name)?;
        let normalized_region = region.to_lowercase();
        self.ensure_region_valid(&normalized_region)?;
        fs::create_dir_all(self.bucket_root(name)).await?;

        let bucket = Bucket {
            id: Uuid::new_v4(),
            name: name.to_string(),
            owner_id: Uuid::new_v4(),
            region: normalized_region,
            created_at: Utc::now(),
        };

        match sqlx::query(
            "INSERT INTO buckets (id, name, owner_id, region, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(bucket.id)
        .bind(&bucket.name)
        .bind(bucket.owner_id)
        .bind(&bucket.region)
        .bind(bucket.created_at)
        .execute(&*self.db)
        .await
        {
            Ok(_) => Ok(bucket),
            Err(err) if is_unique_violation(&err) => {
                Err(StoreError::BucketAlreadyExists(name.to_string()))
            }
            Err(err) => Err(StoreError::Sqlx(err)),
        }
    }

    fn signature(&self, region: &str, bucket: &str, key: &str, expires: i64) -> String {
        let payload = format!(
            "{}\n{}\n{}\n{}\n{}",
            self.signing_key, region, bucket, key, expires
        );
        format!("{:x}", md5::compute(payload))
    }

    /// Accept only a URL carrying a matching, unexpired signature.
    fn verify_signature(&self, location: &ObjectLocation, url: &str) -> StoreResult<()> {
        let denied = |reason: &str| StoreError::AccessDenied(format!("{}: {}", reason, url));
        let query = location.query.as_deref().ok_or_else(|| denied("url is not signed"))?;
        let expires = query_param(query, "q-expires")
            .and_then(|value| value.parse::<i64>().ok())
            .ok_or_else(|| denied("missing q-expires"))?;
        let provided = query_param(query, "q-signature").ok_or_else(|| denied("missing q-signature"))?;

        if provided != self.signature(&location.region, &location.bucket, &location.key, expires) {
            return Err(denied("signature mismatch"));
        }
        if expires < Utc::now().timestamp() {
            return Err(denied("signed url expired"));
        }
        Ok(())
    }

    /// Remove empty directories from `start` up to, not including, `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }

    async fn open_payload(&self, bucket: &Bucket, key: &str) -> StoreResult<File> {
        File::open(self.object_path(&bucket.name, key))
            .await
            .map_err(|err| match err.kind() {
                ErrorKind::NotFound => StoreError::ObjectNotFound {
                    bucket: bucket.name.clone(),
                    key: key.to_string(),
                },
                _ => StoreError::Io(err),
            })
    }

    /// Copy the payload file for a copy request, unless source and
    /// destination are the same file.
    async fn copy_payload(&self, source: &Path, destination: &Path) -> StoreResult<()> {
        if source == destination {
            return Ok(());
        }
        let parent = destination
            .parent()
            .ok_or_else(|| StoreError::Io(io::Error::other("object path missing parent directory")))?;
        fs::create_dir_all(parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        if let Err(err) = fs::copy(source, &tmp_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        if let Err(err) = fs::rename(&tmp_path, destination).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for StorageService {
    async fn head_object(&self, bucket: &str, region: &str, key: &str) -> StoreResult<HeadObject> {
        let (_, object) = self.locate(bucket, region, key).await?;
        let metadata = self.load_metadata(object.id).await?;
        let tag_count = self.load_tags(object.id).await?.len();
        Ok(HeadObject::new(head_headers(&object, metadata, tag_count)))
    }

    fn get_object_signed_url(
        &self,
        bucket: &str,
        region: &str,
        key: &str,
        expires: Duration,
    ) -> StoreResult<String> {
        self.ensure_key_safe(key)?;
        let ttl = i64::try_from(expires.as_secs())
            .map_err(|_| StoreError::Request(format!("url expiry {:?} out of range", expires)))?;
        let expires_at = Utc::now().timestamp().saturating_add(ttl);
        Ok(format!(
            "{}?q-expires={}&q-signature={}",
            self.get_object_unsigned_url(bucket, region, key),
            expires_at,
            self.signature(region, bucket, key, expires_at)
        ))
    }

    fn get_object_unsigned_url(&self, bucket: &str, region: &str, key: &str) -> String {
        format!("{}{}/{}/{}", URL_BASE, region, bucket, key)
    }

    async fn get_object_acl(&self, bucket: &str, region: &str, key: &str) -> StoreResult<ObjectAcl> {
        let (bucket, object) = self.locate(bucket, region, key).await?;
        let owner_id = bucket.owner_id.to_string();
        Ok(ObjectAcl {
            owner: Owner {
                id: owner_id.clone(),
                display_name: owner_id.clone(),
            },
            grants: vec![Grant {
                grantee: owner_id,
                permission: "FULL_CONTROL".into(),
            }],
            params: AclParams {
                acl: Some(object.acl),
                ..AclParams::default()
            },
            request_id: Some(Uuid::new_v4().to_string()),
        })
    }

    async fn get_object_tagging(&self, bucket: &str, region: &str, key: &str) -> StoreResult<Vec<Tag>> {
        let (_, object) = self.locate(bucket, region, key).await?;
        self.load_tags(object.id).await
    }

    async fn put_object_tagging(
        &self,
        bucket: &str,
        region: &str,
        key: &str,
        tags: &[Tag],
    ) -> StoreResult<()> {
        let (_, object) = self.locate(bucket, region, key).await?;
        self.replace_tags(object.id, tags).await
    }

    /// Copy `request.copy_source` onto `request.key`. Tags travel with the
    /// payload; metadata follows the directive.
    async fn copy_object(&self, request: CopyObjectRequest) -> StoreResult<CopyObjectResult> {
        let source = parse_object_url(&request.copy_source)?;
        let (source_bucket, source_object) = self
            .locate(&source.bucket, &source.region, &source.key)
            .await?;
        self.ensure_key_safe(&request.key)?;
        let dest_bucket = self.fetch_bucket(&request.bucket, &request.region).await?;

        let (content_type, metadata) = match request.metadata_directive {
            MetadataDirective::Replaced => (
                request.headers.get("content-type").cloned(),
                request.headers.clone(),
            ),
            MetadataDirective::Copy => (
                source_object.content_type.clone(),
                self.load_metadata(source_object.id)
                    .await?
                    .into_iter()
                    .map(|entry| (entry.key, entry.value))
                    .collect(),
            ),
        };
        let tags = self.load_tags(source_object.id).await?;

        self.copy_payload(
            &self.object_path(&source_bucket.name, &source.key),
            &self.object_path(&dest_bucket.name, &request.key),
        )
        .await?;

        let acl = request.acl.acl.as_deref().unwrap_or(DEFAULT_ACL);
        let object = self
            .upsert_object(
                &dest_bucket,
                &request.key,
                ObjectRow {
                    content_type: content_type.as_deref(),
                    size_bytes: source_object.size_bytes,
                    etag: source_object.etag.as_deref(),
                    crc64: source_object.crc64.as_deref(),
                    acl,
                    storage_class: &source_object.storage_class,
                },
            )
            .await?;
        self.replace_metadata(object.id, &metadata).await?;
        self.replace_tags(object.id, &tags).await?;

        debug!(
            "copied {}/{} to {}/{}",
            source_bucket.name, source.key, dest_bucket.name, request.key
        );
        Ok(CopyObjectResult {
            etag: format!("\"{}\"", object.etag.unwrap_or_default()),
            last_modified: http_date(&object.last_modified),
        })
    }

    /// Soft-delete an object and remove its payload.
    async fn delete_object(&self, bucket: &str, region: &str, key: &str) -> StoreResult<DeleteResult> {
        let (bucket_rec, _) = self.locate(bucket, region, key).await?;

        let result = sqlx::query("UPDATE objects SET is_deleted = 1 WHERE key = ? AND bucket_id = ?")
            .bind(key)
            .bind(bucket_rec.id)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }

        let file_path = self.object_path(&bucket_rec.name, key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(StoreError::Io(err)),
        }
        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent, &self.bucket_root(&bucket_rec.name))
                .await;
        }

        Ok(DeleteResult {
            status_code: 204,
            request_id: Some(Uuid::new_v4().to_string()),
        })
    }

    async fn open_range_read(&self, url: &str, range: Option<Range<u64>>) -> StoreResult<ByteStream> {
        let location = parse_object_url(url)?;
        self.verify_signature(&location, url)?;
        let (bucket, object) = self
            .locate(&location.bucket, &location.region, &location.key)
            .await?;
        let mut file = self.open_payload(&bucket, &location.key).await?;

        let size = u64::try_from(object.size_bytes).unwrap_or(0);
        let (start, end) = match range {
            Some(range) => {
                let start = range.start.min(size);
                (start, range.end.clamp(start, size))
            }
            None => (0, size),
        };
        if start > 0 {
            file.seek(SeekFrom::Start(start)).await?;
        }
        Ok(ReaderStream::new(file.take(end - start)).boxed())
    }
}

fn http_date(value: &DateTime<Utc>) -> String {
    value.format(HTTP_DATE_FORMAT).to_string()
}

/// Response headers of a HEAD request: the store-managed headers followed by
/// the stored ones.
fn head_headers(object: &Object, metadata: Vec<ObjectMetadata>, tag_count: usize) -> Headers {
    let mut headers = Headers::new();
    headers.insert(
        "content-type".into(),
        object
            .content_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".into()),
    );
    headers.insert("content-length".into(), object.size_bytes.max(0).to_string());
    if let Some(etag) = &object.etag {
        headers.insert("etag".into(), format!("\"{}\"", etag));
    }
    if let Some(crc64) = &object.crc64 {
        headers.insert("x-cos-hash-crc64ecma".into(), crc64.clone());
    }
    headers.insert("last-modified".into(), http_date(&object.last_modified));
    headers.insert("date".into(), http_date(&Utc::now()));
    headers.insert("server".into(), "cos-local".into());
    headers.insert("x-cos-request-id".into(), Uuid::new_v4().to_string());
    headers.insert("x-cos-storage-class".into(), object.storage_class.clone());
    if tag_count > 0 {
        headers.insert("x-cos-tagging-count".into(), tag_count.to_string());
    }
    for entry in metadata {
        headers.entry(entry.key).or_insert(entry.value);
    }
    headers
}

/// Split `http://cos-local/{region}/{bucket}/{key}[?query]`.
fn parse_object_url(url: &str) -> StoreResult<ObjectLocation> {
    let invalid = || StoreError::InvalidUrl(url.to_string());
    let rest = url.strip_prefix(URL_BASE).ok_or_else(invalid)?;
    let (path, query) = match rest.split_once('?') {
        Some((path, query)) => (path, Some(query.to_string())),
        None => (rest, None),
    };
    let mut parts = path.splitn(3, '/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(region), Some(bucket), Some(key))
            if !region.is_empty() && !bucket.is_empty() && !key.is_empty() =>
        {
            Ok(ObjectLocation {
                region: region.to_string(),
                bucket: bucket.to_string(),
                key: key.to_string(),
                query,
            })
        }
        _ => Err(invalid()),
    }
}

fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

/// Names formatted like `1.2.3.4`.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|segment| {
            !segment.is_empty()
                && segment.len() <= 3
                && segment.chars().all(|c| c.is_ascii_digit())
                && segment.parse::<u8>().is_ok()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::rename::{Credentials, ObjectRef, RunConfig, TaskOutput};
    use crate::services::{
        copy_executor::{LOOP_MARKER_HEADER, LOOP_MARKER_VALUE},
        rename_engine::{EngineOptions, RenameEngine},
    };
    use crc::{CRC_64_XZ, Crc};
    use futures::{TryStreamExt, stream};
    use sqlx::sqlite::SqlitePoolOptions;
    use tempfile::TempDir;

    const BUCKET: &str = "photos-1250000000";
    const REGION: &str = "ap-guangzhou";

    async fn service() -> (StorageService, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let service = StorageService::new(Arc::new(pool), dir.path(), "test-secret");
        service.init_schema().await.unwrap();
        service
            .create_bucket(BUCKET, REGION.to_string())
            .await
            .unwrap();
        (service, dir)
    }

    async fn upload(service: &StorageService, key: &str, body: &'static [u8], options: UploadOptions) -> Object {
        let chunks = body
            .chunks(3)
            .map(|chunk| Ok(Bytes::from_static(chunk)))
            .collect::<Vec<io::Result<Bytes>>>();
        service
            .upload_object_stream(BUCKET, key, options, stream::iter(chunks))
            .await
            .unwrap()
    }

    async fn read_all(service: &StorageService, url: &str, range: Option<Range<u64>>) -> StoreResult<Vec<u8>> {
        let chunks: Vec<Bytes> = service
            .open_range_read(url, range)
            .await?
            .try_collect()
            .await?;
        Ok(chunks.concat())
    }

    #[tokio::test]
    async fn bucket_names_and_regions_are_validated() {
        let (service, _dir) = service().await;
        assert!(matches!(
            service.create_bucket("Bad_Name", REGION.into()).await,
            Err(StoreError::InvalidBucketName { .. })
        ));
        assert!(matches!(
            service.create_bucket("192.168.1.1", REGION.into()).await,
            Err(StoreError::InvalidBucketName { .. })
        ));
        assert!(matches!(
            service.create_bucket("other-bucket", "us-east-1".into()).await,
            Err(StoreError::UnsupportedRegion(_))
        ));
        assert!(matches!(
            service.create_bucket(BUCKET, REGION.into()).await,
            Err(StoreError::BucketAlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn upload_then_head_reports_digests_and_metadata() {
        let (service, _dir) = service().await;
        let mut headers = Headers::new();
        headers.insert("x-cos-meta-author".into(), "alice".into());
        headers.insert("etag".into(), "\"forged\"".into());
        upload(
            &service,
            "docs/readme.txt",
            b"hello world",
            UploadOptions {
                content_type: Some("text/plain".into()),
                headers,
                tags: vec![Tag::new("team", "docs")],
                acl: None,
            },
        )
        .await;

        let head = service
            .head_object(BUCKET, REGION, "docs/readme.txt")
            .await
            .unwrap();
        assert_eq!(head.header("content-type"), Some("text/plain"));
        assert_eq!(head.header("content-length"), Some("11"));
        assert_eq!(
            head.header("etag"),
            Some("\"5eb63bbbe01eeed093cb22bb8f5acdc3\"")
        );
        let crc = Crc::<u64>::new(&CRC_64_XZ).checksum(b"hello world").to_string();
        assert_eq!(head.header("x-cos-hash-crc64ecma"), Some(crc.as_str()));
        assert_eq!(head.header("x-cos-meta-author"), Some("alice"));
        assert_eq!(head.header("x-cos-tagging-count"), Some("1"));
        assert!(head.last_modified().is_some());
    }

    #[tokio::test]
    async fn region_must_match_the_bucket() {
        let (service, _dir) = service().await;
        upload(&service, "a.txt", b"a", UploadOptions::default()).await;
        assert!(matches!(
            service.head_object(BUCKET, "ap-beijing", "a.txt").await,
            Err(StoreError::RegionMismatch { .. })
        ));
        assert!(matches!(
            service.head_object(BUCKET, REGION, "missing.txt").await,
            Err(StoreError::ObjectNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn unsafe_keys_are_rejected() {
        let (service, _dir) = service().await;
        for key in ["", "/abs", "a/../b", "what?x=1", "tab\tkey"] {
            let result = service
                .upload_object_stream(BUCKET, key, UploadOptions::default(), stream::empty())
                .await;
            assert!(matches!(result, Err(StoreError::InvalidObjectKey)), "{key:?}");
        }
    }

    #[tokio::test]
    async fn signed_urls_gate_range_reads() {
        let (service, _dir) = service().await;
        upload(&service, "data.bin", b"0123456789", UploadOptions::default()).await;

        let url = service
            .get_object_signed_url(BUCKET, REGION, "data.bin", Duration::from_secs(60))
            .unwrap();
        assert_eq!(read_all(&service, &url, None).await.unwrap(), b"0123456789");
        assert_eq!(read_all(&service, &url, Some(2..5)).await.unwrap(), b"234");
        assert_eq!(read_all(&service, &url, Some(8..100)).await.unwrap(), b"89");

        let unsigned = service.get_object_unsigned_url(BUCKET, REGION, "data.bin");
        assert!(matches!(
            read_all(&service, &unsigned, None).await,
            Err(StoreError::AccessDenied(_))
        ));

        let tampered = url.replace("q-signature=", "q-signature=0");
        assert!(matches!(
            read_all(&service, &tampered, None).await,
            Err(StoreError::AccessDenied(_))
        ));

        let expired = format!(
            "{}?q-expires=1&q-signature={}",
            unsigned,
            service.signature(REGION, BUCKET, "data.bin", 1)
        );
        assert!(matches!(
            read_all(&service, &expired, None).await,
            Err(StoreError::AccessDenied(_))
        ));
    }

    #[tokio::test]
    async fn copy_replaces_or_carries_metadata() {
        let (service, _dir) = service().await;
        let mut headers = Headers::new();
        headers.insert("x-cos-meta-author".into(), "alice".into());
        upload(
            &service,
            "src.txt",
            b"payload",
            UploadOptions {
                content_type: Some("text/plain".into()),
                headers,
                tags: vec![Tag::new("k", "v")],
                acl: Some("private".into()),
            },
        )
        .await;
        let copy_source = service.get_object_unsigned_url(BUCKET, REGION, "src.txt");

        let mut replaced = Headers::new();
        replaced.insert("content-type".into(), "application/json".into());
        replaced.insert("x-cos-meta-stage".into(), "two".into());
        service
            .copy_object(CopyObjectRequest {
                bucket: BUCKET.into(),
                region: REGION.into(),
                key: "replaced.txt".into(),
                copy_source: copy_source.clone(),
                metadata_directive: MetadataDirective::Replaced,
                headers: replaced,
                acl: AclParams {
                    acl: Some("public-read".into()),
                    ..AclParams::default()
                },
            })
            .await
            .unwrap();
        let head = service.head_object(BUCKET, REGION, "replaced.txt").await.unwrap();
        assert_eq!(head.header("content-type"), Some("application/json"));
        assert_eq!(head.header("x-cos-meta-stage"), Some("two"));
        assert_eq!(head.header("x-cos-meta-author"), None);
        let acl = service.get_object_acl(BUCKET, REGION, "replaced.txt").await.unwrap();
        assert_eq!(acl.forwardable().acl.as_deref(), Some("public-read"));
        assert_eq!(acl.grants[0].permission, "FULL_CONTROL");

        service
            .copy_object(CopyObjectRequest {
                bucket: BUCKET.into(),
                region: REGION.into(),
                key: "carried.txt".into(),
                copy_source,
                metadata_directive: MetadataDirective::Copy,
                headers: Headers::new(),
                acl: AclParams::default(),
            })
            .await
            .unwrap();
        let head = service.head_object(BUCKET, REGION, "carried.txt").await.unwrap();
        assert_eq!(head.header("content-type"), Some("text/plain"));
        assert_eq!(head.header("x-cos-meta-author"), Some("alice"));
        assert_eq!(
            service.get_object_tagging(BUCKET, REGION, "carried.txt").await.unwrap(),
            vec![Tag::new("k", "v")]
        );

        let url = service
            .get_object_signed_url(BUCKET, REGION, "carried.txt", Duration::from_secs(60))
            .unwrap();
        assert_eq!(read_all(&service, &url, None).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn delete_is_soft_and_removes_the_payload() {
        let (service, dir) = service().await;
        upload(&service, "deep/nested/file.txt", b"bye", UploadOptions::default()).await;
        let path = service.object_path(BUCKET, "deep/nested/file.txt");
        assert!(path.exists());

        let deleted = service
            .delete_object(BUCKET, REGION, "deep/nested/file.txt")
            .await
            .unwrap();
        assert_eq!(deleted.status_code, 204);
        assert!(!path.exists());
        assert!(dir.path().join(BUCKET).exists());
        assert!(matches!(
            service.head_object(BUCKET, REGION, "deep/nested/file.txt").await,
            Err(StoreError::ObjectNotFound { .. })
        ));
        assert!(matches!(
            service.delete_object(BUCKET, REGION, "deep/nested/file.txt").await,
            Err(StoreError::ObjectNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn rename_run_against_the_local_store() {
        let (service, _dir) = service().await;
        let mut headers = Headers::new();
        headers.insert("x-cos-meta-author".into(), "alice".into());
        upload(
            &service,
            "raw/cat.jpg",
            b"hello world",
            UploadOptions {
                content_type: Some("image/jpeg".into()),
                headers,
                tags: vec![Tag::new("album", "pets")],
                acl: Some("public-read".into()),
            },
        )
        .await;

        let credentials = Credentials {
            secret_id: "id".into(),
            secret_key: "test-secret".into(),
            session_token: None,
        };
        let mut config = RunConfig::new(
            credentials.clone(),
            vec![ObjectRef::new(BUCKET, REGION, "raw/cat.jpg")],
            "renamed/${InputName}-${MD5}${Ext}",
        );
        config.delete_source_key = true;
        let store: Arc<dyn ObjectStore> = Arc::new(service.clone());
        let results = RenameEngine::new(store.clone(), config, EngineOptions::default())
            .run()
            .await;

        let destination = "renamed/cat-5eb63bbbe01eeed093cb22bb8f5acdc3.jpg";
        match results[0].result() {
            Some(TaskOutput::Copied(copied)) => assert_eq!(copied.key, destination),
            other => panic!("expected a copy, got {other:?} / {:?}", results[0].error()),
        }

        let head = service.head_object(BUCKET, REGION, destination).await.unwrap();
        assert_eq!(head.header(LOOP_MARKER_HEADER), Some(LOOP_MARKER_VALUE));
        assert_eq!(head.header("x-cos-meta-author"), Some("alice"));
        assert_eq!(head.header("content-type"), Some("image/jpeg"));
        assert_eq!(
            service.get_object_tagging(BUCKET, REGION, destination).await.unwrap(),
            vec![Tag::new("album", "pets")]
        );
        let acl = service.get_object_acl(BUCKET, REGION, destination).await.unwrap();
        assert_eq!(acl.params.acl.as_deref(), Some("public-read"));
        assert!(matches!(
            service.head_object(BUCKET, REGION, "raw/cat.jpg").await,
            Err(StoreError::ObjectNotFound { .. })
        ));

        // The renamed object carries the marker, so a second run leaves it alone.
        let config = RunConfig::new(
            credentials,
            vec![ObjectRef::new(BUCKET, REGION, destination)],
            "again/${Key}",
        );
        let results = RenameEngine::new(store, config, EngineOptions::default())
            .run()
            .await;
        assert!(matches!(results[0].result(), Some(TaskOutput::Skipped(_))));
    }
}
