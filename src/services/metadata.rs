//! Object and bucket metadata records.
//!
//! [`ObjectMetadataGateway`] is the boundary every placement and multipart
//! operation writes through; [`SqliteMetadata`] implements it over the same
//! SQLite pool that holds the multipart index.

use crate::{
    errors::{PlacementError, PlacementResult},
    models::{
        bucket::Bucket,
        object::{DataLocation, ObjectRecord},
    },
};
use anyhow::Context;
use async_trait::async_trait;
use sqlx::{SqlitePool, types::Json};
use std::sync::Arc;
use tracing::{debug, info};

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

/// Options of a single metadata call.
#[derive(Debug, Clone, Default)]
pub struct MdOptions {
    /// Version the call targets. A put naming a version updates that version
    /// in place. A put without one stores a new object; over a versioned
    /// record that object must carry its own version id.
    pub version_id: Option<String>,
    /// Only replace a record that still points at exactly these payloads.
    pub if_locations: Option<Vec<DataLocation>>,
}

impl MdOptions {
    pub fn version(version_id: Option<String>) -> Self {
        Self {
            version_id,
            if_locations: None,
        }
    }

    /// In-place update of the record written with `locations`.
    pub fn in_place(version_id: Option<String>, locations: Vec<DataLocation>) -> Self {
        Self {
            version_id,
            if_locations: Some(locations),
        }
    }

    fn is_conditional(&self) -> bool {
        self.version_id.is_some() || self.if_locations.is_some()
    }
}

#[async_trait]
pub trait ObjectMetadataGateway: Send + Sync {
    async fn create_bucket(&self, bucket: &Bucket) -> PlacementResult<()>;

    async fn get_bucket(&self, name: &str) -> PlacementResult<Bucket>;

    /// Fails with `BucketNotEmpty` while the bucket still holds objects.
    async fn delete_bucket(&self, name: &str) -> PlacementResult<()>;

    async fn get_object_md(
        &self,
        bucket: &str,
        key: &str,
        opts: &MdOptions,
    ) -> PlacementResult<ObjectRecord>;

    /// Create or replace the record at `bucket/key`, returning the record it
    /// replaced. Conditional puts fail with `RecordChanged` once the stored
    /// record no longer points at the expected payloads.
    async fn put_object_md(
        &self,
        bucket: &str,
        key: &str,
        record: &ObjectRecord,
        opts: &MdOptions,
    ) -> PlacementResult<Option<ObjectRecord>>;

    /// Remove the record and return what was stored.
    async fn delete_object_md(
        &self,
        bucket: &str,
        key: &str,
        opts: &MdOptions,
    ) -> PlacementResult<ObjectRecord>;
}

/// A versioned record may only be touched by naming its version.
fn ensure_version_matches(existing: &ObjectRecord, opts: &MdOptions) -> PlacementResult<()> {
    match (&existing.version_id, &opts.version_id) {
        (None, _) => Ok(()),
        (Some(stored), Some(given)) if stored == given => Ok(()),
        (Some(stored), Some(given)) => Err(PlacementError::InvalidArgument(format!(
            "version `{given}` does not match stored version `{stored}`"
        ))),
        (Some(_), None) => Err(PlacementError::InvalidArgument(
            "a version id is required to modify a versioned object".into(),
        )),
    }
}

/// Read-then-write transactions take the database write lock up front.
const BEGIN_WRITE: &str = "BEGIN IMMEDIATE";

const OBJECT_COLUMNS: &str = "bucket, key, locations, size_bytes, etag, content_type, version_id, \
                              user_metadata, tags, last_modified";

#[derive(Clone)]
pub struct SqliteMetadata {
    db: Arc<SqlitePool>,
}

impl SqliteMetadata {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    async fn fetch_object<'e, E>(
        executor: E,
        bucket: &str,
        key: &str,
    ) -> PlacementResult<Option<ObjectRecord>>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        let query = format!("SELECT {OBJECT_COLUMNS} FROM objects WHERE bucket = ? AND key = ?");
        let record = sqlx::query_as::<_, ObjectRecord>(&query)
            .bind(bucket)
            .bind(key)
            .fetch_optional(executor)
            .await?;
        Ok(record)
    }
}

#[async_trait]
impl ObjectMetadataGateway for SqliteMetadata {
    async fn create_bucket(&self, bucket: &Bucket) -> PlacementResult<()> {
        match sqlx::query(
            "INSERT INTO buckets (name, location_constraint, created_at, versioning_enabled)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&bucket.name)
        .bind(&bucket.location_constraint)
        .bind(bucket.created_at)
        .bind(bucket.versioning_enabled)
        .execute(&*self.db)
        .await
        {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => {
                Err(PlacementError::BucketAlreadyExists(bucket.name.clone()))
            }
            Err(err) => Err(PlacementError::Metadata(err)),
        }
    }

    async fn get_bucket(&self, name: &str) -> PlacementResult<Bucket> {
        sqlx::query_as::<_, Bucket>(
            "SELECT name, location_constraint, created_at, versioning_enabled
             FROM buckets WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| PlacementError::NoSuchBucket(name.to_string()))
    }

    async fn delete_bucket(&self, name: &str) -> PlacementResult<()> {
        let mut tx = self.db.begin().await?;
        let objects: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM objects WHERE bucket = ?")
            .bind(name)
            .fetch_one(&mut *tx)
            .await?;
        if objects > 0 {
            return Err(PlacementError::BucketNotEmpty(name.to_string()));
        }
        let result = sqlx::query("DELETE FROM buckets WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(PlacementError::NoSuchBucket(name.to_string()));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_object_md(
        &self,
        bucket: &str,
        key: &str,
        opts: &MdOptions,
    ) -> PlacementResult<ObjectRecord> {
        let not_found = || PlacementError::NoSuchKey {
            bucket: bucket.to_string(),
            key: key.to_string(),
        };
        let record = Self::fetch_object(&*self.db, bucket, key)
            .await?
            .ok_or_else(not_found)?;
        match &opts.version_id {
            Some(wanted) if record.version_id.as_ref() != Some(wanted) => Err(not_found()),
            _ => Ok(record),
        }
    }

    async fn put_object_md(
        &self,
        bucket: &str,
        key: &str,
        record: &ObjectRecord,
        opts: &MdOptions,
    ) -> PlacementResult<Option<ObjectRecord>> {
        let mut tx = self.db.begin_with(BEGIN_WRITE).await?;
        let existing = Self::fetch_object(&mut *tx, bucket, key).await?;
        if opts.is_conditional() {
            let current = existing.as_ref().ok_or_else(|| PlacementError::NoSuchKey {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;
            if let Some(expected) = &opts.if_locations {
                if current.locations.0 != *expected {
                    return Err(PlacementError::RecordChanged {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                    });
                }
            }
            if opts.version_id.is_some() {
                ensure_version_matches(current, opts)?;
            }
        } else if let Some(existing) = &existing {
            // a new write over a versioned record must itself be a version
            if record.version_id.is_none() {
                ensure_version_matches(existing, opts)?;
            }
        }

        sqlx::query(
            r#"
            INSERT INTO objects (
                bucket, key, locations, size_bytes, etag, content_type,
                version_id, user_metadata, tags, last_modified
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(bucket, key) DO UPDATE SET
                locations = excluded.locations,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                content_type = excluded.content_type,
                version_id = excluded.version_id,
                user_metadata = excluded.user_metadata,
                tags = excluded.tags,
                last_modified = excluded.last_modified
            "#,
        )
        .bind(bucket)
        .bind(key)
        .bind(Json(&record.locations.0))
        .bind(record.size_bytes)
        .bind(&record.etag)
        .bind(&record.content_type)
        .bind(&record.version_id)
        .bind(Json(&record.user_metadata.0))
        .bind(Json(&record.tags.0))
        .bind(record.last_modified)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!(bucket = %bucket, key = %key, replaced = existing.is_some(), "stored object metadata");
        Ok(existing)
    }

    async fn delete_object_md(
        &self,
        bucket: &str,
        key: &str,
        opts: &MdOptions,
    ) -> PlacementResult<ObjectRecord> {
        let mut tx = self.db.begin_with(BEGIN_WRITE).await?;
        let existing = Self::fetch_object(&mut *tx, bucket, key)
            .await?
            .ok_or_else(|| PlacementError::NoSuchKey {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;
        ensure_version_matches(&existing, opts)?;
        sqlx::query("DELETE FROM objects WHERE bucket = ? AND key = ?")
            .bind(bucket)
            .bind(key)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(existing)
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

/// Apply the embedded schema. Every statement is idempotent.
pub async fn run_migrations(db: &SqlitePool) -> anyhow::Result<()> {
    let statements = SCHEMA
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    info!("Running {} migration statements...", statements.len());

    for stmt in statements {
        debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt)
            .execute(db)
            .await
            .with_context(|| format!("applying migration statement `{stmt}`"))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{models::object::DataLocation, test_support::memory_pool};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn bucket(name: &str) -> Bucket {
        Bucket {
            name: name.into(),
            location_constraint: Some("mem".into()),
            created_at: Utc::now(),
            versioning_enabled: false,
        }
    }

    fn record(bucket: &str, key: &str, version_id: Option<&str>) -> ObjectRecord {
        ObjectRecord {
            bucket: bucket.into(),
            key: key.into(),
            locations: Json(vec![DataLocation {
                location: "mem".into(),
                key: "1".into(),
                start: 0,
                size: 11,
            }]),
            size_bytes: 11,
            etag: "be747eb4b75517bf6b3cf7c5fbb62f3a".into(),
            content_type: None,
            version_id: version_id.map(str::to_string),
            user_metadata: Json(BTreeMap::from([("color".into(), "blue".into())])),
            tags: Json(BTreeMap::new()),
            last_modified: Utc::now(),
        }
    }

    #[tokio::test]
    async fn bucket_lifecycle() {
        let md = SqliteMetadata::new(memory_pool().await);
        md.create_bucket(&bucket("photos")).await.unwrap();
        assert!(matches!(
            md.create_bucket(&bucket("photos")).await,
            Err(PlacementError::BucketAlreadyExists(_))
        ));
        let stored = md.get_bucket("photos").await.unwrap();
        assert_eq!(stored.location_constraint.as_deref(), Some("mem"));

        md.put_object_md("photos", "a.jpg", &record("photos", "a.jpg", None), &MdOptions::default())
            .await
            .unwrap();
        assert!(matches!(
            md.delete_bucket("photos").await,
            Err(PlacementError::BucketNotEmpty(_))
        ));
        md.delete_object_md("photos", "a.jpg", &MdOptions::default())
            .await
            .unwrap();
        md.delete_bucket("photos").await.unwrap();
        assert!(matches!(
            md.get_bucket("photos").await,
            Err(PlacementError::NoSuchBucket(_))
        ));
    }

    #[tokio::test]
    async fn versioned_records_are_updated_by_version_id() {
        let md = SqliteMetadata::new(memory_pool().await);
        md.create_bucket(&bucket("docs")).await.unwrap();
        let versioned = record("docs", "k", Some("v1"));
        let replaced = md
            .put_object_md("docs", "k", &versioned, &MdOptions::default())
            .await
            .unwrap();
        assert!(replaced.is_none());

        let mut tagged = versioned.clone();
        tagged.tags.0.insert("indexer0".into(), "cat".into());
        assert!(matches!(
            md.put_object_md("docs", "k", &tagged, &MdOptions::version(Some("v0".into())))
                .await,
            Err(PlacementError::InvalidArgument(_))
        ));
        md.put_object_md("docs", "k", &tagged, &MdOptions::version(Some("v1".into())))
            .await
            .unwrap();

        let read = md
            .get_object_md("docs", "k", &MdOptions::version(Some("v1".into())))
            .await
            .unwrap();
        assert_eq!(read.tags.0.get("indexer0").map(String::as_str), Some("cat"));
        assert_eq!(read.locations.0.len(), 1);
        assert!(matches!(
            md.get_object_md("docs", "k", &MdOptions::version(Some("v2".into())))
                .await,
            Err(PlacementError::NoSuchKey { .. })
        ));
        assert!(matches!(
            md.delete_object_md("docs", "k", &MdOptions::default()).await,
            Err(PlacementError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn new_writes_replace_any_version_and_return_it() {
        let md = SqliteMetadata::new(memory_pool().await);
        md.create_bucket(&bucket("docs")).await.unwrap();
        md.put_object_md("docs", "k", &record("docs", "k", Some("v1")), &MdOptions::default())
            .await
            .unwrap();

        let mut newer = record("docs", "k", Some("v2"));
        newer.locations.0[0].key = "2".into();
        let replaced = md
            .put_object_md("docs", "k", &newer, &MdOptions::default())
            .await
            .unwrap()
            .expect("first version was replaced");
        assert_eq!(replaced.version_id.as_deref(), Some("v1"));
        assert_eq!(replaced.locations.0[0].key, "1");

        // an unversioned write may not silently displace a version
        assert!(matches!(
            md.put_object_md("docs", "k", &record("docs", "k", None), &MdOptions::default())
                .await,
            Err(PlacementError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn in_place_update_fails_once_the_payload_moved() {
        let md = SqliteMetadata::new(memory_pool().await);
        md.create_bucket(&bucket("docs")).await.unwrap();
        let first = record("docs", "k", None);
        md.put_object_md("docs", "k", &first, &MdOptions::default())
            .await
            .unwrap();

        let mut second = record("docs", "k", None);
        second.locations.0[0].key = "2".into();
        md.put_object_md("docs", "k", &second, &MdOptions::default())
            .await
            .unwrap();

        // a tag write computed from the first record must not bring it back
        let mut stale = first.clone();
        stale.tags.0.insert("indexer0".into(), "cat".into());
        let opts = MdOptions::in_place(None, first.locations.0.clone());
        assert!(matches!(
            md.put_object_md("docs", "k", &stale, &opts).await,
            Err(PlacementError::RecordChanged { .. })
        ));
        let stored = md.get_object_md("docs", "k", &MdOptions::default()).await.unwrap();
        assert_eq!(stored.locations.0[0].key, "2");
        assert!(stored.tags.0.is_empty());

        md.delete_object_md("docs", "k", &MdOptions::default())
            .await
            .unwrap();
        assert!(matches!(
            md.put_object_md("docs", "k", &stale, &opts).await,
            Err(PlacementError::NoSuchKey { .. })
        ));
        assert!(matches!(
            md.get_object_md("docs", "k", &MdOptions::default()).await,
            Err(PlacementError::NoSuchKey { .. })
        ));
    }
}
