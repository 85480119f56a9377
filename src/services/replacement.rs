//! Builds the placeholder → value map for one object.
//!
//! Path, name, timestamp and header-provided digests come from one (cached)
//! head request. Digests the template needs but the headers lack are computed
//! in a single streamed read of the object body; when there are none the body
//! is never read.

use crate::models::rename::ObjectRef;
use crate::services::{
    error::{RenameError, RenameResult, StoreError},
    hashing::{HashAlgorithm, HashDigests, MultiHashStream},
    rename_engine::TaskContext,
};
use chrono::{DateTime, FixedOffset, Utc};
use chrono_tz::Tz;
use futures::StreamExt;
use std::{collections::BTreeMap, time::Duration};
use tracing::debug;

pub type ReplacementMap = BTreeMap<String, String>;

/// Lifetime of the signed URL used for the hashing read.
pub const SIGNED_URL_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

/// Placeholders derived from the key and the head response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placeholder {
    Bucket,
    Region,
    Key,
    InputPath,
    InputFullName,
    InputName,
    Ext,
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
}

impl Placeholder {
    const TIMESTAMP_PARTS: [Placeholder; 6] = [
        Placeholder::Year,
        Placeholder::Month,
        Placeholder::Day,
        Placeholder::Hour,
        Placeholder::Minute,
        Placeholder::Second,
    ];

    pub fn token(self) -> &'static str {
        match self {
            Placeholder::Bucket => "${Bucket}",
            Placeholder::Region => "${Region}",
            Placeholder::Key => "${Key}",
            Placeholder::InputPath => "${InputPath}",
            Placeholder::InputFullName => "${InputFullName}",
            Placeholder::InputName => "${InputName}",
            Placeholder::Ext => "${Ext}",
            Placeholder::Year => "${Year}",
            Placeholder::Month => "${Month}",
            Placeholder::Day => "${Day}",
            Placeholder::Hour => "${Hour}",
            Placeholder::Minute => "${Minute}",
            Placeholder::Second => "${Second}",
        }
    }
}

pub async fn build_replacement_map(
    ctx: &TaskContext<'_>,
    object: &ObjectRef,
    template: &str,
    timezone: Option<&str>,
) -> RenameResult<ReplacementMap> {
    let url = ctx.store.inner().get_object_signed_url(
        &object.bucket,
        &object.region,
        &object.key,
        SIGNED_URL_EXPIRY,
    )?;
    let head = ctx
        .store
        .head_object(&object.bucket, &object.region, &object.key)
        .await?;

    let mut map = ReplacementMap::new();
    let mut set = |placeholder: Placeholder, value: &str| {
        map.insert(placeholder.token().to_string(), value.to_string());
    };

    let (path, full_name) = split_key(&object.key);
    let (name, ext) = split_extension(full_name);
    set(Placeholder::Bucket, &object.bucket);
    set(Placeholder::Region, &object.region);
    set(Placeholder::Key, &object.key);
    set(Placeholder::InputPath, path);
    set(Placeholder::InputFullName, full_name);
    set(Placeholder::InputName, name);
    set(Placeholder::Ext, ext);

    let last_modified = head
        .last_modified()
        .ok_or_else(|| RenameError::InvalidLastModified(object.key.clone()))?;
    let stamp = format_timestamp(last_modified, timezone)?;
    for (placeholder, part) in Placeholder::TIMESTAMP_PARTS.into_iter().zip(stamp.split('-')) {
        set(placeholder, part);
    }

    let mut streamed = Vec::new();
    for algorithm in HashAlgorithm::ALL {
        match head.header(algorithm.metadata_header()) {
            Some(value) => {
                map.insert(
                    algorithm.placeholder().to_string(),
                    value.trim().to_ascii_lowercase(),
                );
            }
            None if template.contains(algorithm.placeholder()) => streamed.push(algorithm),
            None => {}
        }
    }

    if !streamed.is_empty() {
        debug!("{}: hashing body for {:?}", object, streamed);
        let digests = hash_object(ctx, object, &url, &streamed).await?;
        for algorithm in streamed {
            if let Some(value) = digests.placeholder_value(algorithm) {
                map.insert(algorithm.placeholder().to_string(), value);
            }
        }
    }

    Ok(map)
}

/// Read the object once through a `MultiHashStream`, discarding the bytes.
///
/// The read is registered with the run so `cancel` can abort it.
async fn hash_object(
    ctx: &TaskContext<'_>,
    object: &ObjectRef,
    url: &str,
    algorithms: &[HashAlgorithm],
) -> RenameResult<HashDigests> {
    let token = ctx.run.register_stream(ctx.task_id)?;

    let body = tokio::select! {
        biased;
        _ = token.cancelled() => return Err(ctx.run.cancel_error()),
        body = ctx.store.inner().open_range_read(url, None) => body?,
    };

    let (mut stream, digests) = MultiHashStream::new(body, algorithms);
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(ctx.run.cancel_error()),
            chunk = stream.next() => match chunk {
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(StoreError::Io(err).into()),
                None => break,
            },
        }
    }

    digests
        .await
        .map_err(|_| RenameError::HashIncomplete(object.key.clone()))
}

/// Split a key into its directory part (with trailing `/`) and basename.
fn split_key(key: &str) -> (&str, &str) {
    match key.rfind('/') {
        Some(idx) => (&key[..=idx], &key[idx + 1..]),
        None => ("", key),
    }
}

/// Split a basename into stem and extension (with leading dot). A leading
/// dot alone does not start an extension.
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    }
}

fn format_timestamp(
    timestamp: DateTime<FixedOffset>,
    timezone: Option<&str>,
) -> RenameResult<String> {
    match timezone.map(str::trim).filter(|tz| !tz.is_empty()) {
        Some(name) => {
            let tz: Tz = name
                .parse()
                .map_err(|_| RenameError::UnknownTimezone(name.to_string()))?;
            Ok(timestamp.with_timezone(&tz).format(TIMESTAMP_FORMAT).to_string())
        }
        None => Ok(timestamp.with_timezone(&Utc).format(TIMESTAMP_FORMAT).to_string()),
    }
}
