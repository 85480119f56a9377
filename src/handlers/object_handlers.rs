//! HTTP handlers for bucket and object operations on the local store.
//! Object bodies are streamed to `StorageService`, never buffered.

use crate::{errors::AppError, state::AppState};
use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use cos_rename::{
    models::cos::{Headers, Tag},
    services::{storage_service::UploadOptions, store::ObjectStore},
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::io;

/// Standard headers kept with an upload, next to `x-cos-meta-*`.
const STORED_HEADERS: [&str; 4] = [
    "cache-control",
    "content-disposition",
    "content-encoding",
    "expires",
];

/// Optional JSON body of `PUT /{bucket}`.
#[derive(Debug, Deserialize)]
pub struct CreateBucketReq {
    #[serde(rename = "LocationConstraint")]
    pub location_constraint: Option<String>,
}

/// PUT `/{bucket}`: create a bucket.
pub async fn create_bucket(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let payload = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        Some(
            serde_json::from_slice::<CreateBucketReq>(&body)
                .map_err(|err| AppError::bad_request(format!("invalid bucket request: {}", err)))?,
        )
    };
    let region = payload
        .and_then(|p| p.location_constraint)
        .unwrap_or_else(|| "local".into());

    let created = state.storage.create_bucket(&bucket, region).await?;
    Ok(Json(json!({
        "Location": format!("/{}", created.name),
        "Region": created.region,
    })))
}

/// PUT `/{bucket}/{*key}`: upload an object.
pub async fn upload_object(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, AppError> {
    let options = upload_options(&headers)?;
    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other));

    let object = state
        .storage
        .upload_object_stream(&bucket, &key, options, stream)
        .await?;

    let mut response = Response::new(Body::empty());
    let resp_headers = response.headers_mut();
    if let Some(etag) = object.etag.as_deref() {
        if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
            resp_headers.insert(header::ETAG, value);
        }
    }
    if let Some(crc64) = object.crc64.as_deref() {
        if let Ok(value) = HeaderValue::from_str(crc64) {
            resp_headers.insert(HeaderName::from_static("x-cos-hash-crc64ecma"), value);
        }
    }
    Ok(response)
}

/// HEAD `/{bucket}/{*key}`: the headers the store reports for the object.
pub async fn head_object(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let region = state.storage.bucket(&bucket).await?.region;
    let head = state.storage.head_object(&bucket, &region, &key).await?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    let resp_headers = response.headers_mut();
    for (name, value) in &head.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            resp_headers.insert(name, value);
        }
    }
    Ok(response)
}

/// Collect content type, stored headers, `x-cos-tagging` and `x-cos-acl`.
fn upload_options(headers: &HeaderMap) -> Result<UploadOptions, AppError> {
    let text = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    let mut stored = Headers::new();
    for (name, value) in headers {
        let name = name.as_str();
        if name.starts_with("x-cos-meta-") || STORED_HEADERS.contains(&name) {
            let value = value
                .to_str()
                .map_err(|_| AppError::bad_request(format!("header `{}` is not valid text", name)))?;
            stored.insert(name.to_string(), value.to_string());
        }
    }

    let tags = match text("x-cos-tagging") {
        Some(value) => parse_tagging(&value)?,
        None => Vec::new(),
    };

    Ok(UploadOptions {
        content_type: text(header::CONTENT_TYPE.as_str()),
        headers: stored,
        tags,
        acl: text("x-cos-acl"),
    })
}

/// Parse `k1=v1&k2=v2`.
fn parse_tagging(value: &str) -> Result<Vec<Tag>, AppError> {
    value
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok(Tag::new(key, value)),
            _ => Err(AppError::bad_request(format!("malformed tag `{}`", pair))),
        })
        .collect()
}
