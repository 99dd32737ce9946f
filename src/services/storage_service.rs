//! src/services/storage_service.rs
//!
//! StorageService: bucket and object operations. Object bytes go to the
//! backend picked by the placement rule; the object record written through
//! the metadata gateway points at them by `(location, storage key)`.

use crate::{
    backends::{BackendClient, ByteRange, ByteStream, PutHints},
    errors::{PlacementError, PlacementResult},
    models::{
        bucket::Bucket,
        object::{DataLocation, ObjectRecord},
    },
    services::{
        backend_info::BackendInfo,
        enrichment::{Enricher, tee_stream},
        metadata::{MdOptions, ObjectMetadataGateway},
        registry::LocationRegistry,
    },
};
use base64::{Engine as _, engine::general_purpose};
use chrono::Utc;
use futures::{StreamExt, TryStreamExt, stream};
use sqlx::SqlitePool;
use std::{collections::BTreeMap, io, sync::Arc};
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;
const TEE_CAPACITY: usize = 64;

/// Request-scoped inputs of an object write.
#[derive(Debug, Clone, Default)]
pub struct WriteContext {
    /// Object-level location hint (`x-amz-meta-scal-location-constraint`).
    pub location_hint: Option<String>,
    /// Host the request reached the gateway through.
    pub request_endpoint: String,
    pub content_type: Option<String>,
    pub user_metadata: BTreeMap<String, String>,
    /// Base64 MD5 the caller claims for the payload.
    pub content_md5: Option<String>,
    pub size_hint: Option<u64>,
}

/// A parsed `Range: bytes=...` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    FromTo(u64, u64),
    From(u64),
    Suffix(u64),
}

impl RangeSpec {
    /// Parse a single-range header. Anything else is ignored by callers.
    pub fn parse(header: &str) -> Option<Self> {
        let spec = header.trim().strip_prefix("bytes=")?;
        if spec.contains(',') {
            return None;
        }
        let (start, end) = spec.split_once('-')?;
        match (start.trim(), end.trim()) {
            ("", "") => None,
            ("", suffix) => suffix.parse().ok().map(Self::Suffix),
            (start, "") => start.parse().ok().map(Self::From),
            (start, end) => {
                let (start, end) = (start.parse().ok()?, end.parse().ok()?);
                (start <= end).then_some(Self::FromTo(start, end))
            }
        }
    }

    /// Concrete range within an object of `size` bytes.
    pub fn resolve(self, size: u64) -> PlacementResult<ByteRange> {
        let range = match self {
            Self::FromTo(start, end) if start < size => ByteRange::new(start, end.min(size - 1)),
            Self::From(start) if start < size => ByteRange::new(start, size - 1),
            Self::Suffix(len) if len > 0 && size > 0 => {
                ByteRange::new(size.saturating_sub(len), size - 1)
            }
            _ => return Err(PlacementError::InvalidRange),
        };
        Ok(range)
    }
}

/// One backend read needed to serve (part of) an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentRead {
    pub location: String,
    pub key: String,
    /// Range within the stored payload. `None` reads all of it.
    pub range: Option<ByteRange>,
}

/// Map an object-level range onto the data locations that hold it.
pub fn plan_segments(locations: &[DataLocation], range: Option<ByteRange>) -> Vec<SegmentRead> {
    let Some(range) = range else {
        return locations
            .iter()
            .map(|loc| SegmentRead {
                location: loc.location.clone(),
                key: loc.key.clone(),
                range: None,
            })
            .collect();
    };
    locations
        .iter()
        .filter(|loc| loc.size > 0)
        .filter_map(|loc| {
            let seg_end = loc.start + loc.size - 1;
            if range.end < loc.start || range.start > seg_end {
                return None;
            }
            let from = range.start.max(loc.start) - loc.start;
            let to = range.end.min(seg_end) - loc.start;
            let whole = from == 0 && to == loc.size - 1;
            Some(SegmentRead {
                location: loc.location.clone(),
                key: loc.key.clone(),
                range: (!whole).then(|| ByteRange::new(from, to)),
            })
        })
        .collect()
}

/// Compare a base64 `Content-MD5` against the hex digest of the stored bytes.
pub(crate) fn content_md5_matches(expected_b64: &str, actual_hex: &str) -> PlacementResult<bool> {
    let decoded = general_purpose::STANDARD
        .decode(expected_b64.trim())
        .map_err(|_| PlacementError::InvalidArgument("Content-MD5 is not valid base64".into()))?;
    Ok(hex::encode(decoded) == actual_hex)
}

/// StorageService provides the object operations on top of placement:
/// - Put an object (resolve location, write bytes, record metadata)
/// - Get / head an object (read the record, stream bytes from its locations)
/// - Delete an object (remove the record, then its bytes)
/// - Create / delete buckets
#[derive(Clone)]
pub struct StorageService {
    /// Shared SQLite connection pool behind the metadata gateway.
    pub db: Arc<SqlitePool>,
    metadata: Arc<dyn ObjectMetadataGateway>,
    registry: Arc<LocationRegistry>,
    enricher: Option<Arc<Enricher>>,
}

impl StorageService {
    pub fn new(
        db: Arc<SqlitePool>,
        metadata: Arc<dyn ObjectMetadataGateway>,
        registry: Arc<LocationRegistry>,
    ) -> Self {
        Self {
            db,
            metadata,
            registry,
            enricher: None,
        }
    }

    /// Feed matching uploads to an indexer.
    pub fn with_enricher(mut self, enricher: Arc<Enricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    pub fn registry(&self) -> &Arc<LocationRegistry> {
        &self.registry
    }

    pub fn metadata(&self) -> &Arc<dyn ObjectMetadataGateway> {
        &self.metadata
    }

    /// Basic key validation to avoid trivial path traversal vectors.
    pub(crate) fn ensure_key_safe(&self, key: &str) -> PlacementResult<()> {
        if key.is_empty()
            || key.len() > MAX_OBJECT_KEY_LEN
            || key.starts_with('/')
            || key.contains("..")
            || key
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(PlacementError::InvalidObjectKey);
        }
        Ok(())
    }

    /// Validate bucket name format.
    ///
    /// Enforces S3-like naming rules:
    /// - 3–63 characters
    /// - lowercase letters, digits, dots, hyphens only
    /// - cannot start/end with dot or hyphen
    /// - cannot contain consecutive dots or dot-hyphen patterns
    /// - cannot look like an IPv4 address
    fn ensure_bucket_name_safe(&self, name: &str) -> PlacementResult<()> {
        let invalid = |reason: &str| PlacementError::InvalidBucketName {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        if name.len() < BUCKET_NAME_MIN_LEN || name.len() > BUCKET_NAME_MAX_LEN {
            return Err(invalid("must be between 3 and 63 characters"));
        }
        if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
        {
            return Err(invalid(
                "allowed characters are lowercase letters, digits, dots, and hyphens",
            ));
        }
        if name.starts_with(['.', '-']) || name.ends_with(['.', '-']) {
            return Err(invalid("must start and end with a lowercase letter or digit"));
        }
        if name.contains("..") || name.contains("-.") || name.contains(".-") {
            return Err(invalid(
                "cannot contain consecutive dots or dot-hyphen combinations",
            ));
        }
        if is_ipv4_like(name) {
            return Err(invalid("must not be formatted like an IP address"));
        }
        Ok(())
    }

    /// Validate a region against the configured legacy region list.
    fn ensure_region_valid(&self, region: &str) -> PlacementResult<()> {
        if self
            .registry
            .regions()
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(region))
        {
            Ok(())
        } else {
            Err(PlacementError::InvalidLocationConstraint(region.to_string()))
        }
    }

    pub async fn get_bucket(&self, name: &str) -> PlacementResult<Bucket> {
        self.ensure_bucket_name_safe(name)?;
        self.metadata.get_bucket(name).await
    }

    /// Create a bucket.
    ///
    /// A named location constraint must be registered. Without one the bucket
    /// takes the endpoint table's location for the request host. In legacy
    /// mode the constraint is a region from the configured list.
    pub async fn create_bucket(
        &self,
        name: &str,
        location_constraint: Option<&str>,
        versioning_enabled: bool,
        request_endpoint: &str,
    ) -> PlacementResult<Bucket> {
        self.ensure_bucket_name_safe(name)?;
        let requested = location_constraint.filter(|lc| !lc.is_empty());

        let location_constraint = if self.registry.is_legacy() {
            let region = match requested {
                Some(region) => region.to_lowercase(),
                None => self
                    .registry
                    .regions()
                    .first()
                    .cloned()
                    .ok_or_else(|| PlacementError::InvalidArgument("no region configured".into()))?,
            };
            self.ensure_region_valid(&region)?;
            Some(region)
        } else {
            match requested {
                Some(lc) if self.registry.contains(lc) => Some(lc.to_string()),
                Some(lc) => return Err(PlacementError::InvalidLocationConstraint(lc.to_string())),
                None => self
                    .registry
                    .endpoint_location(request_endpoint)
                    .map(str::to_string),
            }
        };

        let bucket = Bucket {
            name: name.to_string(),
            location_constraint,
            created_at: Utc::now(),
            versioning_enabled,
        };
        self.metadata.create_bucket(&bucket).await?;
        info!(bucket = %name, location = ?bucket.location_constraint, "created bucket");
        Ok(bucket)
    }

    pub async fn delete_bucket(&self, name: &str) -> PlacementResult<()> {
        self.ensure_bucket_name_safe(name)?;
        self.metadata.delete_bucket(name).await?;
        info!(bucket = %name, "deleted bucket");
        Ok(())
    }

    /// Resolve the controlling location of a write into `bucket`.
    pub fn resolve_location(
        &self,
        bucket: &Bucket,
        location_hint: Option<&str>,
        request_endpoint: &str,
    ) -> PlacementResult<String> {
        BackendInfo::resolve(
            &self.registry,
            location_hint,
            bucket.location_constraint.as_deref(),
            request_endpoint,
        )
    }

    pub(crate) fn client(&self, location: &str) -> PlacementResult<Arc<dyn BackendClient>> {
        Ok(self.registry.client(location)?)
    }

    /// Stream-upload an object to its controlling location and record it.
    ///
    /// A previous object at the key is replaced wholesale; the bytes of the
    /// record actually replaced are reclaimed after the new record is written.
    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        stream: ByteStream,
        ctx: WriteContext,
    ) -> PlacementResult<ObjectRecord> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.get_bucket(bucket).await?;
        let location = self.resolve_location(
            &bucket_rec,
            ctx.location_hint.as_deref(),
            &ctx.request_endpoint,
        )?;
        let client = self.client(&location)?;

        let (stream, enrichment) = match &self.enricher {
            Some(enricher) if enricher.wants(ctx.content_type.as_deref()) => {
                let (primary, secondary) = tee_stream(stream, TEE_CAPACITY);
                (primary, Some(enricher.start(bucket, key, secondary)))
            }
            _ => (stream, None),
        };

        let hints = PutHints {
            bucket: bucket.to_string(),
            key: key.to_string(),
            content_type: ctx.content_type.clone(),
        };
        let stored = client
            .put(stream, ctx.size_hint, &hints)
            .await
            .map_err(|err| PlacementError::backend("put", &location, err))?;
        let new_location = DataLocation {
            location: location.clone(),
            key: stored.key.clone(),
            start: 0,
            size: stored.size,
        };

        if let Some(expected) = ctx.content_md5.as_deref() {
            let matches = content_md5_matches(expected, &stored.md5_hex);
            if !matches!(matches, Ok(true)) {
                self.release_locations(std::slice::from_ref(&new_location)).await;
                return Err(matches.err().unwrap_or(PlacementError::BadDigest));
            }
        }

        let record = ObjectRecord {
            bucket: bucket.to_string(),
            key: key.to_string(),
            locations: sqlx::types::Json(vec![new_location.clone()]),
            size_bytes: stored.size as i64,
            etag: stored.md5_hex,
            content_type: ctx.content_type,
            version_id: bucket_rec
                .versioning_enabled
                .then(|| Uuid::new_v4().to_string()),
            user_metadata: sqlx::types::Json(ctx.user_metadata),
            tags: sqlx::types::Json(BTreeMap::new()),
            last_modified: Utc::now(),
        };
        let replaced = match self
            .metadata
            .put_object_md(bucket, key, &record, &MdOptions::default())
            .await
        {
            Ok(replaced) => replaced,
            Err(err) => {
                self.release_locations(std::slice::from_ref(&new_location)).await;
                return Err(err);
            }
        };

        if let Some(previous) = replaced {
            self.release_locations(&previous.locations).await;
        }
        if let Some(handle) = enrichment {
            handle.commit(record.locations.0.clone());
        }
        debug!(bucket = %bucket, key = %key, location = %location, size = record.size_bytes, "stored object");
        Ok(record)
    }

    /// Fetch only object metadata.
    pub async fn head_object(&self, bucket: &str, key: &str) -> PlacementResult<ObjectRecord> {
        self.ensure_key_safe(key)?;
        self.get_bucket(bucket).await?;
        self.metadata
            .get_object_md(bucket, key, &MdOptions::default())
            .await
    }

    /// Fetch an object for reading, optionally a byte range of it.
    ///
    /// Returns the record, the resolved range and a stream over the bytes.
    pub async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        range: Option<RangeSpec>,
    ) -> PlacementResult<(ObjectRecord, Option<ByteRange>, ByteStream)> {
        let record = self.head_object(bucket, key).await?;
        let range = range
            .map(|spec| spec.resolve(record.size_bytes.max(0) as u64))
            .transpose()?;
        let stream = self.open_data(&record, range).await?;
        Ok((record, range, stream))
    }

    /// Stream the bytes of `record` (or of `range` within it) from its locations.
    ///
    /// The first backend read happens before returning so a missing payload
    /// surfaces as an error; later segments are opened as the stream advances.
    pub async fn open_data(
        &self,
        record: &ObjectRecord,
        range: Option<ByteRange>,
    ) -> PlacementResult<ByteStream> {
        let mut reads = Vec::new();
        for segment in plan_segments(&record.locations, range) {
            let client = self.client(&segment.location)?;
            reads.push((client, segment));
        }
        let mut reads = reads.into_iter();
        let Some((client, first)) = reads.next() else {
            return Ok(Box::pin(stream::empty::<io::Result<bytes::Bytes>>()));
        };
        let head = client
            .get(&first.key, first.range)
            .await
            .map_err(|err| PlacementError::backend("get", &first.location, err))?;

        let rest = stream::iter(reads)
            .then(|(client, segment)| async move {
                client
                    .get(&segment.key, segment.range)
                    .await
                    .map_err(|err| io::Error::other(format!("{}: {err}", segment.location)))
            })
            .try_flatten();
        Ok(Box::pin(head.chain(rest)))
    }

    /// Remove an object record, then its bytes.
    pub async fn delete_object(
        &self,
        bucket: &str,
        key: &str,
        version_id: Option<String>,
    ) -> PlacementResult<ObjectRecord> {
        self.ensure_key_safe(key)?;
        self.get_bucket(bucket).await?;
        let removed = self
            .metadata
            .delete_object_md(bucket, key, &MdOptions::version(version_id))
            .await?;
        self.release_locations(&removed.locations).await;
        debug!(bucket = %bucket, key = %key, "deleted object");
        Ok(removed)
    }

    /// Best-effort delete of stored payloads. Failures are logged, not returned.
    pub(crate) async fn release_locations(&self, locations: &[DataLocation]) {
        for loc in locations {
            let client = match self.registry.client(&loc.location) {
                Ok(client) => client,
                Err(err) => {
                    warn!(location = %loc.location, key = %loc.key, error = %err, "cannot release payload");
                    continue;
                }
            };
            match client.delete(&loc.key).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {
                    debug!(location = %loc.location, key = %loc.key, "payload already gone");
                }
                Err(err) => {
                    warn!(location = %loc.location, key = %loc.key, error = %err, "failed to release payload");
                }
            }
        }
    }
}

/// Check if a string matches IPv4-like dotted decimal form.
/// Rejects names formatted like `1.2.3.4`.
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
