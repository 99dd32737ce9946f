//! Represents multipart upload sessions and parts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, types::Json};
use std::collections::BTreeMap;

/// Lowest accepted part number.
pub const MIN_PART_NUMBER: u32 = 1;

/// Highest accepted part number.
pub const MAX_PART_NUMBER: u32 = 10_000;

/// Lifecycle of an upload. `Completed` and `Aborted` accept no more writes.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    Initiated,
    PartsAccumulating,
    Completed,
    Aborted,
}

impl UploadState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

/// Overview record of a multipart upload, created at initiate time.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct MultipartUpload {
    /// Opaque upload ID returned to the client.
    pub upload_id: String,

    pub bucket: String,

    /// Object key being uploaded.
    pub key: String,

    /// Controlling location resolved at initiate. Every part lands here.
    pub location: String,

    /// Timestamp when upload was initiated.
    pub initiated_at: DateTime<Utc>,

    /// User metadata captured at initiate.
    pub user_metadata: Json<BTreeMap<String, String>>,

    pub content_type: Option<String>,

    pub state: UploadState,
}

impl MultipartUpload {
    pub fn target(&self) -> UploadTarget<'_> {
        UploadTarget {
            bucket: &self.bucket,
            key: &self.key,
            upload_id: &self.upload_id,
        }
    }

    /// Whether this upload was initiated for the object `target` names.
    pub fn is_for(&self, target: UploadTarget<'_>) -> bool {
        self.upload_id == target.upload_id && self.bucket == target.bucket && self.key == target.key
    }
}

/// An upload id together with the object path it is addressed through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UploadTarget<'a> {
    pub bucket: &'a str,
    pub key: &'a str,
    pub upload_id: &'a str,
}

impl<'a> UploadTarget<'a> {
    pub fn new(bucket: &'a str, key: &'a str, upload_id: &'a str) -> Self {
        Self {
            bucket,
            key,
            upload_id,
        }
    }
}

/// Represents a single uploaded part in a multipart upload session.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct MultipartPart {
    pub upload_id: String,

    /// Part number (1-based).
    pub part_number: u32,

    /// Size in bytes.
    pub size_bytes: i64,

    /// Hex MD5 of the part payload.
    pub etag: String,

    /// Location that holds the payload.
    pub location: String,

    /// Backend storage key of the payload.
    pub data_key: String,

    /// Timestamp when this part was last written.
    pub last_modified: DateTime<Utc>,
}

/// Part reference supplied by a completion request.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPart {
    pub part_number: u32,

    /// Optional ETag to check against the recorded part.
    #[serde(default)]
    pub etag: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_completed_and_aborted_are_terminal() {
        assert!(!UploadState::Initiated.is_terminal());
        assert!(!UploadState::PartsAccumulating.is_terminal());
        assert!(UploadState::Completed.is_terminal());
        assert!(UploadState::Aborted.is_terminal());
    }

    #[test]
    fn uploads_belong_to_one_object_path() {
        let upload = MultipartUpload {
            upload_id: "u1".into(),
            bucket: "bucketa".into(),
            key: "secret".into(),
            location: "mem".into(),
            initiated_at: Utc::now(),
            user_metadata: Json(BTreeMap::new()),
            content_type: None,
            state: UploadState::Initiated,
        };
        assert!(upload.is_for(upload.target()));
        assert!(!upload.is_for(UploadTarget::new("bucketb", "secret", "u1")));
        assert!(!upload.is_for(UploadTarget::new("bucketa", "other", "u1")));
    }

    #[test]
    fn completed_part_etag_is_optional() {
        let part: CompletedPart = serde_json::from_str(r#"{"partNumber": 3}"#).unwrap();
        assert_eq!(part.part_number, 3);
        assert!(part.etag.is_none());
    }
}
