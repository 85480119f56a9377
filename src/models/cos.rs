//! Request and response shapes exchanged with an object store.
//!
//! These mirror the subset of the COS API the rename pipeline relies on:
//! head, ACL and tagging reads, server-side copy, tag writes and deletes.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Header map with lowercased names, ordered for stable output.
pub type Headers = BTreeMap<String, String>;

/// Response of a HEAD request on an object.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct HeadObject {
    /// All response headers, names lowercased.
    pub headers: Headers,
}

impl HeadObject {
    pub fn new(headers: Headers) -> Self {
        Self { headers }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Parse the `last-modified` header (an HTTP date).
    pub fn last_modified(&self) -> Option<DateTime<FixedOffset>> {
        self.header("last-modified")
            .and_then(|value| DateTime::parse_from_rfc2822(value.trim()).ok())
    }
}

/// Owner of an object as reported by the ACL endpoint.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Owner {
    #[serde(rename = "ID")]
    pub id: String,
    pub display_name: String,
}

/// A single permission grant.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Grant {
    pub grantee: String,
    pub permission: String,
}

/// ACL parameters that can be forwarded on a copy request.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct AclParams {
    #[serde(rename = "ACL", skip_serializing_if = "Option::is_none")]
    pub acl: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grant_read: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grant_write: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grant_read_acp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grant_write_acp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grant_full_control: Option<String>,
}

/// Full response of an ACL read.
///
/// Only `params` is meaningful on a copy request; the grant list, owner and
/// request id are response bookkeeping.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ObjectAcl {
    pub owner: Owner,
    pub grants: Vec<Grant>,
    #[serde(flatten)]
    pub params: AclParams,
    pub request_id: Option<String>,
}

impl ObjectAcl {
    /// The ACL parameters to replay on a copy, without the bookkeeping fields.
    pub fn forwardable(&self) -> AclParams {
        self.params.clone()
    }
}

/// An object tag.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// How a copy treats the destination's metadata.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetadataDirective {
    /// Carry the source object's metadata over.
    Copy,
    /// Use exactly the headers supplied with the request.
    Replaced,
}

/// Server-side copy of `copy_source` onto `bucket/key`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CopyObjectRequest {
    pub bucket: String,
    pub region: String,
    pub key: String,
    /// URL of the source object (unsigned).
    pub copy_source: String,
    pub metadata_directive: MetadataDirective,
    pub headers: Headers,
    pub acl: AclParams,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct CopyObjectResult {
    #[serde(rename = "ETag")]
    pub etag: String,
    pub last_modified: String,
}

/// Response of an object deletion, returned to callers verbatim.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct DeleteResult {
    pub status_code: u16,
    pub request_id: Option<String>,
}
