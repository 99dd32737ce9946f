//! Represents a logical bucket: a top-level container for objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A storage bucket in the S3-compatible system.
///
/// Besides naming a namespace, a bucket carries the location constraint that
/// places its objects when a write names no object-level location.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Bucket {
    /// Globally unique bucket name (must conform to DNS naming rules).
    pub name: String,

    /// Location constraint fixed at creation. In legacy mode this is the region.
    pub location_constraint: Option<String>,

    /// When this bucket was created.
    pub created_at: DateTime<Utc>,

    /// Whether writes receive a fresh version identifier.
    pub versioning_enabled: bool,
}
