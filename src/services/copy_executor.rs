//! Server-side copy to the templated key, and the optional source delete.

use crate::models::{
    cos::{CopyObjectRequest, DeleteResult, HeadObject, Headers, MetadataDirective},
    rename::{CopyOutcome, ObjectRef, TriggerType},
};
use crate::services::{
    error::RenameResult, rename_engine::TaskContext, replacement::ReplacementMap, template,
};
use tracing::debug;

/// Written on every object this pipeline produces; objects carrying it are
/// not renamed again.
pub const LOOP_MARKER_HEADER: &str = "x-cos-meta-scf-rename";
pub const LOOP_MARKER_VALUE: &str = "true";

/// Added to copies made for a COS workflow.
pub const PROVENANCE_HEADER: &str = "x-cos-meta-workflow-source";
pub const PROVENANCE_VALUE: &str = "scf-cos-rename";

/// Store-managed headers that must not be replayed on a copy.
const EXCLUDED_HEADERS: [&str; 9] = [
    "connection",
    "content-length",
    "date",
    "etag",
    "last-modified",
    "server",
    "x-cos-tagging-count",
    "x-cos-hash-crc64ecma",
    "x-cos-request-id",
];

pub fn is_loop_risk(head: &HeadObject) -> bool {
    head.header(LOOP_MARKER_HEADER)
        .is_some_and(|value| value.trim().eq_ignore_ascii_case(LOOP_MARKER_VALUE))
}

/// The source headers minus the store-managed ones.
pub fn copyable_headers(head: &HeadObject) -> Headers {
    head.headers
        .iter()
        .filter(|(name, _)| !EXCLUDED_HEADERS.contains(&name.to_ascii_lowercase().as_str()))
        .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
        .collect()
}

pub async fn copy_object(
    ctx: &TaskContext<'_>,
    object: &ObjectRef,
    replacements: &ReplacementMap,
    key_template: &str,
    trigger: TriggerType,
) -> RenameResult<CopyOutcome> {
    let store = ctx.store.inner();
    let copy_source = store.get_object_unsigned_url(&object.bucket, &object.region, &object.key);

    let (head, acl, tags) = tokio::try_join!(
        ctx.store
            .head_object(&object.bucket, &object.region, &object.key),
        store.get_object_acl(&object.bucket, &object.region, &object.key),
        store.get_object_tagging(&object.bucket, &object.region, &object.key),
    )?;

    let destination_key = template::resolve(key_template, replacements);

    let mut headers = copyable_headers(&head);
    headers.insert(LOOP_MARKER_HEADER.to_string(), LOOP_MARKER_VALUE.to_string());
    if trigger.is_workflow() {
        headers.insert(PROVENANCE_HEADER.to_string(), PROVENANCE_VALUE.to_string());
    }
    debug!("{}: copying to {} with headers {:?}", object, destination_key, headers);

    store
        .copy_object(CopyObjectRequest {
            bucket: object.bucket.clone(),
            region: object.region.clone(),
            key: destination_key.clone(),
            copy_source,
            metadata_directive: MetadataDirective::Replaced,
            headers,
            acl: acl.forwardable(),
        })
        .await?;

    if !tags.is_empty() {
        store
            .put_object_tagging(&object.bucket, &object.region, &destination_key, &tags)
            .await?;
    }

    Ok(CopyOutcome {
        bucket: object.bucket.clone(),
        region: object.region.clone(),
        key: destination_key,
    })
}

pub async fn delete_object(ctx: &TaskContext<'_>, object: &ObjectRef) -> RenameResult<DeleteResult> {
    Ok(ctx
        .store
        .inner()
        .delete_object(&object.bucket, &object.region, &object.key)
        .await?)
}
