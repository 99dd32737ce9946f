//! Multipart upload index.
//!
//! An upload is one overview row plus one row per part in SQLite. The
//! controlling location is resolved once at initiate time and every later
//! part, whatever hints it carries, is written to that location.
//!
//! Payload writes run without any lock. Installing a part record, completing
//! and aborting all take the upload's own mutex, so a part that races a
//! completion or an abort either lands before it or is cleaned up by its
//! writer. The mutex map only holds entries for uploads someone is holding
//! or waiting on.
//!
//! Every call after initiate names the bucket and key as well as the upload
//! id; an upload is invisible through any other object path.

use crate::{
    backends::{ByteStream, PutHints, StoredPayload},
    errors::{PlacementError, PlacementResult},
    models::{
        multipart::{
            CompletedPart, MAX_PART_NUMBER, MIN_PART_NUMBER, MultipartPart, MultipartUpload,
            UploadState, UploadTarget,
        },
        object::{DataLocation, ObjectRecord},
    },
    services::{
        metadata::MdOptions,
        storage_service::{RangeSpec, StorageService, WriteContext, content_md5_matches},
    },
};
use chrono::Utc;
use dashmap::DashMap;
use md5::Context;
use sqlx::{SqlitePool, types::Json};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

const OVERVIEW_COLUMNS: &str =
    "upload_id, bucket, key, location, initiated_at, user_metadata, content_type, state";
const PART_COLUMNS: &str =
    "upload_id, part_number, size_bytes, etag, location, data_key, last_modified";

fn ensure_part_number(part_number: u32) -> PlacementResult<()> {
    if (MIN_PART_NUMBER..=MAX_PART_NUMBER).contains(&part_number) {
        Ok(())
    } else {
        Err(PlacementError::InvalidArgument(format!(
            "part number must be an integer between {MIN_PART_NUMBER} and {MAX_PART_NUMBER}, got {part_number}"
        )))
    }
}

fn part_location(part: &MultipartPart) -> DataLocation {
    DataLocation {
        location: part.location.clone(),
        key: part.data_key.clone(),
        start: 0,
        size: part.size_bytes.max(0) as u64,
    }
}

/// ETag of an assembled object: MD5 over the binary part digests, then `-N`.
pub fn multipart_etag(part_etags: &[&str]) -> PlacementResult<String> {
    let mut digest = Context::new();
    for etag in part_etags {
        let raw = hex::decode(etag)
            .map_err(|_| PlacementError::InvalidPart(format!("part ETag `{etag}` is not hex")))?;
        digest.consume(raw);
    }
    Ok(format!("{:x}-{}", digest.compute(), part_etags.len()))
}

type UploadLocks = Arc<DashMap<String, Arc<Mutex<()>>>>;

/// Exclusive hold on one upload. The map entry is dropped together with the
/// last holder or waiter.
struct UploadLock {
    locks: UploadLocks,
    upload_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for UploadLock {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.upload_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[derive(Clone)]
pub struct MultipartService {
    db: Arc<SqlitePool>,
    storage: StorageService,
    locks: UploadLocks,
}

impl MultipartService {
    pub fn new(db: Arc<SqlitePool>, storage: StorageService) -> Self {
        Self {
            db,
            storage,
            locks: Arc::new(DashMap::new()),
        }
    }

    async fn lock_upload(&self, upload_id: &str) -> UploadLock {
        let mut held = UploadLock {
            locks: self.locks.clone(),
            upload_id: upload_id.to_string(),
            guard: None,
        };
        let lock = self.locks.entry(upload_id.to_string()).or_default().clone();
        held.guard = Some(lock.lock_owned().await);
        held
    }

    async fn fetch_overview(&self, upload_id: &str) -> PlacementResult<Option<MultipartUpload>> {
        let query = format!("SELECT {OVERVIEW_COLUMNS} FROM mpu_overview WHERE upload_id = ?");
        Ok(sqlx::query_as::<_, MultipartUpload>(&query)
            .bind(upload_id)
            .fetch_optional(&*self.db)
            .await?)
    }

    /// Overview of the upload if it was initiated for the target's object.
    async fn overview_for(
        &self,
        target: UploadTarget<'_>,
    ) -> PlacementResult<Option<MultipartUpload>> {
        Ok(self
            .fetch_overview(target.upload_id)
            .await?
            .filter(|o| o.is_for(target)))
    }

    /// Overview of an upload that still accepts parts.
    async fn live_overview(&self, target: UploadTarget<'_>) -> PlacementResult<MultipartUpload> {
        match self.overview_for(target).await? {
            Some(overview) if !overview.state.is_terminal() => Ok(overview),
            _ => Err(PlacementError::NoSuchUpload(target.upload_id.to_string())),
        }
    }

    async fn fetch_parts(&self, upload_id: &str) -> PlacementResult<Vec<MultipartPart>> {
        let query = format!(
            "SELECT {PART_COLUMNS} FROM mpu_parts WHERE upload_id = ? ORDER BY part_number ASC"
        );
        Ok(sqlx::query_as::<_, MultipartPart>(&query)
            .bind(upload_id)
            .fetch_all(&*self.db)
            .await?)
    }

    async fn set_state(&self, upload_id: &str, state: UploadState) -> PlacementResult<()> {
        sqlx::query("UPDATE mpu_overview SET state = ? WHERE upload_id = ?")
            .bind(state)
            .bind(upload_id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    async fn delete_records(&self, upload_id: &str) -> PlacementResult<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM mpu_parts WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM mpu_overview WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Start an upload. Only the hints given here decide where its parts go.
    pub async fn initiate(
        &self,
        bucket: &str,
        key: &str,
        ctx: &WriteContext,
    ) -> PlacementResult<MultipartUpload> {
        self.storage.ensure_key_safe(key)?;
        let bucket_rec = self.storage.get_bucket(bucket).await?;
        let location = self.storage.resolve_location(
            &bucket_rec,
            ctx.location_hint.as_deref(),
            &ctx.request_endpoint,
        )?;
        self.storage.client(&location)?;

        let upload = MultipartUpload {
            upload_id: Uuid::new_v4().simple().to_string(),
            bucket: bucket.to_string(),
            key: key.to_string(),
            location,
            initiated_at: Utc::now(),
            user_metadata: Json(ctx.user_metadata.clone()),
            content_type: ctx.content_type.clone(),
            state: UploadState::Initiated,
        };
        sqlx::query(
            "INSERT INTO mpu_overview
             (upload_id, bucket, key, location, initiated_at, user_metadata, content_type, state)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&upload.upload_id)
        .bind(&upload.bucket)
        .bind(&upload.key)
        .bind(&upload.location)
        .bind(upload.initiated_at)
        .bind(Json(&upload.user_metadata.0))
        .bind(&upload.content_type)
        .bind(upload.state)
        .execute(&*self.db)
        .await?;

        info!(upload_id = %upload.upload_id, bucket = %bucket, key = %key, location = %upload.location, "initiated multipart upload");
        Ok(upload)
    }

    /// Store one part on the upload's location and record it.
    pub async fn put_part(
        &self,
        target: UploadTarget<'_>,
        part_number: u32,
        body: ByteStream,
        content_md5: Option<&str>,
        size_hint: Option<u64>,
    ) -> PlacementResult<MultipartPart> {
        ensure_part_number(part_number)?;
        let overview = self.live_overview(target).await?;
        let stored = self.write_payload(&overview, body, size_hint).await?;

        if let Some(expected) = content_md5 {
            let matches = content_md5_matches(expected, &stored.md5_hex);
            if !matches!(matches, Ok(true)) {
                self.release_payload(&overview.location, &stored).await;
                return Err(matches.err().unwrap_or(PlacementError::BadDigest));
            }
        }
        self.install_part(&overview, part_number, stored).await
    }

    /// Copy an existing object (or a range of it) in as a part.
    ///
    /// The bytes are always re-written to the upload's location, even when
    /// the source already lives there.
    pub async fn copy_part(
        &self,
        target: UploadTarget<'_>,
        part_number: u32,
        source_bucket: &str,
        source_key: &str,
        range: Option<RangeSpec>,
    ) -> PlacementResult<MultipartPart> {
        ensure_part_number(part_number)?;
        let overview = self.live_overview(target).await?;
        let source = self.storage.head_object(source_bucket, source_key).await?;
        let range = range
            .map(|spec| spec.resolve(source.size_bytes.max(0) as u64))
            .transpose()?;
        let size = range.map_or(source.size_bytes.max(0) as u64, |r| r.len());
        let data = self.storage.open_data(&source, range).await?;
        let stored = self.write_payload(&overview, data, Some(size)).await?;
        debug!(upload_id = %target.upload_id, part_number, source_bucket = %source_bucket, source_key = %source_key, "copied part");
        self.install_part(&overview, part_number, stored).await
    }

    async fn write_payload(
        &self,
        overview: &MultipartUpload,
        body: ByteStream,
        size_hint: Option<u64>,
    ) -> PlacementResult<StoredPayload> {
        let client = self.storage.client(&overview.location)?;
        let hints = PutHints {
            bucket: overview.bucket.clone(),
            key: overview.key.clone(),
            content_type: overview.content_type.clone(),
        };
        client
            .put(body, size_hint, &hints)
            .await
            .map_err(|err| PlacementError::backend("upload part", &overview.location, err))
    }

    async fn release_payload(&self, location: &str, stored: &StoredPayload) {
        let loc = DataLocation {
            location: location.to_string(),
            key: stored.key.clone(),
            start: 0,
            size: stored.size,
        };
        self.storage.release_locations(std::slice::from_ref(&loc)).await;
    }

    /// Record a written part, replacing any earlier upload of the same number.
    async fn install_part(
        &self,
        overview: &MultipartUpload,
        part_number: u32,
        stored: StoredPayload,
    ) -> PlacementResult<MultipartPart> {
        let upload_id = overview.upload_id.as_str();
        let held = self.lock_upload(upload_id).await;

        if !matches!(self.fetch_overview(upload_id).await?, Some(o) if !o.state.is_terminal()) {
            drop(held);
            debug!(upload_id = %upload_id, part_number, "upload ended while the part was written");
            self.release_payload(&overview.location, &stored).await;
            return Err(PlacementError::NoSuchUpload(upload_id.to_string()));
        }

        let query =
            format!("SELECT {PART_COLUMNS} FROM mpu_parts WHERE upload_id = ? AND part_number = ?");
        let previous = sqlx::query_as::<_, MultipartPart>(&query)
            .bind(upload_id)
            .bind(part_number)
            .fetch_optional(&*self.db)
            .await?;

        let part = MultipartPart {
            upload_id: upload_id.to_string(),
            part_number,
            size_bytes: stored.size as i64,
            etag: stored.md5_hex,
            location: overview.location.clone(),
            data_key: stored.key,
            last_modified: Utc::now(),
        };
        sqlx::query(
            r#"
            INSERT INTO mpu_parts
                (upload_id, part_number, size_bytes, etag, location, data_key, last_modified)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(upload_id, part_number) DO UPDATE SET
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                location = excluded.location,
                data_key = excluded.data_key,
                last_modified = excluded.last_modified
            "#,
        )
        .bind(&part.upload_id)
        .bind(part.part_number)
        .bind(part.size_bytes)
        .bind(&part.etag)
        .bind(&part.location)
        .bind(&part.data_key)
        .bind(part.last_modified)
        .execute(&*self.db)
        .await?;
        self.set_state(upload_id, UploadState::PartsAccumulating)
            .await?;
        drop(held);

        if let Some(previous) = previous {
            debug!(upload_id = %upload_id, part_number, "part overwritten; releasing previous payload");
            self.storage
                .release_locations(&[part_location(&previous)])
                .await;
        }
        Ok(part)
    }

    /// Parts of a live upload in part-number order.
    pub async fn list_parts(
        &self,
        target: UploadTarget<'_>,
    ) -> PlacementResult<(MultipartUpload, Vec<MultipartPart>)> {
        let overview = self.live_overview(target).await?;
        let parts = self.fetch_parts(target.upload_id).await?;
        Ok((overview, parts))
    }

    /// Assemble the listed parts into the final object.
    ///
    /// Parts must be listed in ascending order, each must have been uploaded
    /// and, when an ETag is given, match it. Unlisted parts and the data of
    /// any object previously stored at the key are released afterwards.
    ///
    /// The upload is marked `Completed` before the object record is written,
    /// so an upload whose parts back a live object is never in a state where
    /// abort would free them.
    pub async fn complete(
        &self,
        target: UploadTarget<'_>,
        parts: &[CompletedPart],
    ) -> PlacementResult<ObjectRecord> {
        let upload_id = target.upload_id;
        let held = self.lock_upload(upload_id).await;
        let overview = self.live_overview(target).await?;

        if parts.is_empty() {
            return Err(PlacementError::InvalidArgument(
                "completion requires at least one part".into(),
            ));
        }
        for part in parts {
            ensure_part_number(part.part_number)?;
        }
        if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(PlacementError::InvalidPartOrder);
        }

        let mut stored: BTreeMap<u32, MultipartPart> = self
            .fetch_parts(upload_id)
            .await?
            .into_iter()
            .map(|p| (p.part_number, p))
            .collect();

        let mut chosen = Vec::with_capacity(parts.len());
        for requested in parts {
            let part = stored.remove(&requested.part_number).ok_or_else(|| {
                PlacementError::InvalidPart(format!(
                    "part {} was never uploaded",
                    requested.part_number
                ))
            })?;
            if let Some(etag) = &requested.etag {
                if etag.trim_matches('"') != part.etag {
                    return Err(PlacementError::InvalidPart(format!(
                        "ETag of part {} does not match",
                        requested.part_number
                    )));
                }
            }
            chosen.push(part);
        }
        let unlisted: Vec<DataLocation> = stored.values().map(part_location).collect();

        let mut locations = Vec::with_capacity(chosen.len());
        let mut offset = 0u64;
        for part in &chosen {
            let mut loc = part_location(part);
            loc.start = offset;
            offset += loc.size;
            locations.push(loc);
        }
        let etags: Vec<&str> = chosen.iter().map(|p| p.etag.as_str()).collect();
        let etag = multipart_etag(&etags)?;

        let bucket_rec = self.storage.get_bucket(&overview.bucket).await?;
        let record = ObjectRecord {
            bucket: overview.bucket.clone(),
            key: overview.key.clone(),
            locations: Json(locations),
            size_bytes: offset as i64,
            etag,
            content_type: overview.content_type.clone(),
            version_id: bucket_rec
                .versioning_enabled
                .then(|| Uuid::new_v4().to_string()),
            user_metadata: overview.user_metadata.clone(),
            tags: Json(BTreeMap::new()),
            last_modified: Utc::now(),
        };
        self.set_state(upload_id, UploadState::Completed).await?;
        let replaced = match self
            .storage
            .metadata()
            .put_object_md(&overview.bucket, &overview.key, &record, &MdOptions::default())
            .await
        {
            Ok(replaced) => replaced,
            Err(err) => {
                if let Err(revert) = self
                    .set_state(upload_id, UploadState::PartsAccumulating)
                    .await
                {
                    warn!(upload_id = %upload_id, error = %revert, "failed completion left the upload marked completed");
                }
                return Err(err);
            }
        };

        self.storage.release_locations(&unlisted).await;
        if let Some(previous) = replaced {
            self.storage.release_locations(&previous.locations).await;
        }
        if let Err(err) = self.delete_records(upload_id).await {
            warn!(upload_id = %upload_id, error = %err, "completed upload left index records behind");
        }
        drop(held);

        info!(upload_id = %upload_id, bucket = %record.bucket, key = %record.key, parts = chosen.len(), "completed multipart upload");
        Ok(record)
    }

    /// Drop an upload and every part payload it holds.
    ///
    /// Aborting an unknown upload, or one initiated for another object,
    /// succeeds without touching any backend.
    pub async fn abort(&self, target: UploadTarget<'_>) -> PlacementResult<()> {
        let upload_id = target.upload_id;
        let held = self.lock_upload(upload_id).await;

        let Some(overview) = self.overview_for(target).await? else {
            debug!(upload_id = %upload_id, bucket = %target.bucket, key = %target.key, "abort of unknown upload");
            return Ok(());
        };

        if overview.state != UploadState::Completed {
            self.set_state(upload_id, UploadState::Aborted).await?;
            let payloads: Vec<DataLocation> = self
                .fetch_parts(upload_id)
                .await?
                .iter()
                .map(part_location)
                .collect();
            self.storage.release_locations(&payloads).await;
        }
        self.delete_records(upload_id).await?;
        drop(held);

        info!(upload_id = %upload_id, bucket = %overview.bucket, key = %overview.key, "aborted multipart upload");
        Ok(())
    }
}
