//! Represents the authoritative metadata record of a stored object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, types::Json};
use std::collections::BTreeMap;

/// Metadata record of one object within a bucket.
///
/// The record does not hold content bytes. It points at one or more data
/// locations, each naming the backend location that holds the payload and
/// the storage key that backend assigned.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ObjectRecord {
    pub bucket: String,

    /// Object key (path-like identifier within the bucket).
    pub key: String,

    /// Payload pointers in byte order. Multipart objects have one per part.
    pub locations: Json<Vec<DataLocation>>,

    /// Size in bytes.
    pub size_bytes: i64,

    /// Hex MD5 for single-part objects, `<hex>-<parts>` for multipart ones.
    pub etag: String,

    /// Content type (MIME type).
    pub content_type: Option<String>,

    /// Version identifier if the bucket is versioned.
    pub version_id: Option<String>,

    /// User metadata (`x-amz-meta-*` without the prefix).
    pub user_metadata: Json<BTreeMap<String, String>>,

    /// Tags attached after the write, e.g. by the indexer.
    pub tags: Json<BTreeMap<String, String>>,

    /// Timestamp when object was last modified.
    pub last_modified: DateTime<Utc>,
}

impl ObjectRecord {
    /// Location name holding the first byte of the object.
    pub fn controlling_location(&self) -> Option<&str> {
        self.locations.first().map(|loc| loc.location.as_str())
    }
}

/// One contiguous run of object bytes held by a single backend.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DataLocation {
    /// Location-constraint name of the backend.
    pub location: String,

    /// Backend-assigned storage key.
    pub key: String,

    /// Offset of this run within the object.
    pub start: u64,

    pub size: u64,
}
