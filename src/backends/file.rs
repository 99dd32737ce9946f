//! Local-disk backend.
//!
//! Payloads are written under `base_path/{shard}/{shard}/{key}` where `key` is
//! a generated 32-hex-digit identifier and the shards are the first two bytes
//! of MD5(key). Writes go to a temp file that is fsynced and renamed into
//! place, so a reader never observes a partial payload.

use super::{
    BackendClient, BackendError, BackendResult, ByteRange, ByteStream, HealthStatus, PutHints,
    StoredPayload, clamp_range,
};
use crate::models::location::LocationKind;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use md5::Context;
use std::{
    io::{self, ErrorKind, SeekFrom},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

const KEY_LEN: usize = 32;

/// Backend storing payloads on the local filesystem. Shared by every `file` location.
#[derive(Debug, Clone)]
pub struct FileBackend {
    base_path: PathBuf,
}

impl FileBackend {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Keys are generated here, so anything that is not 32 hex digits is
    /// rejected before it can reach the filesystem.
    fn ensure_key_safe(key: &str) -> BackendResult<()> {
        if key.len() == KEY_LEN && key.bytes().all(|b| b.is_ascii_hexdigit()) {
            Ok(())
        } else {
            Err(BackendError::InvalidKey(key.to_string()))
        }
    }

    /// Two-level shard directories derived from MD5(key).
    fn shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn payload_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::shards(key);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    async fn open(&self, key: &str) -> BackendResult<File> {
        Self::ensure_key_safe(key)?;
        File::open(self.payload_path(key))
            .await
            .map_err(|err| match err.kind() {
                ErrorKind::NotFound => BackendError::NotFound(key.to_string()),
                _ => BackendError::Io(err),
            })
    }

    /// Remove empty shard directories up to (excluding) the base path.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.base_path) && current != self.base_path {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl BackendClient for FileBackend {
    fn kind(&self) -> LocationKind {
        LocationKind::File
    }

    async fn put(
        &self,
        mut stream: ByteStream,
        _size_hint: Option<u64>,
        _hints: &PutHints,
    ) -> BackendResult<StoredPayload> {
        let key = Uuid::new_v4().simple().to_string();
        let file_path = self.payload_path(&key);
        let parent = file_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| io::Error::other("payload path missing parent directory"))?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size: u64 = 0;
        let mut digest = Context::new();
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(BackendError::Io(err));
                }
            };
            size += chunk.len() as u64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(BackendError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BackendError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BackendError::Io(err));
        }
        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BackendError::Io(err));
        }

        debug!(key = %key, size, "wrote payload {}", file_path.display());
        Ok(StoredPayload {
            key,
            size,
            md5_hex: format!("{:x}", digest.compute()),
        })
    }

    async fn get(&self, key: &str, range: Option<ByteRange>) -> BackendResult<ByteStream> {
        let mut file = self.open(key).await?;
        let Some(range) = range else {
            return Ok(Box::pin(ReaderStream::new(file)));
        };
        let len = file.metadata().await?.len();
        match clamp_range(range, len) {
            Some(r) => {
                file.seek(SeekFrom::Start(r.start)).await?;
                Ok(Box::pin(ReaderStream::new(file.take(r.len()))))
            }
            None => Ok(Box::pin(futures::stream::empty::<io::Result<Bytes>>())),
        }
    }

    /// Missing payloads count as deleted so retries stay harmless.
    async fn delete(&self, key: &str) -> BackendResult<()> {
        Self::ensure_key_safe(key)?;
        let file_path = self.payload_path(key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed payload {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("payload {} already missing", file_path.display());
            }
            Err(err) => return Err(BackendError::Io(err)),
        }
        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    /// Write, read back and remove a probe file under the base path.
    async fn healthcheck(&self) -> BackendResult<HealthStatus> {
        fs::create_dir_all(&self.base_path).await?;
        let probe = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        if let Err(e) = fs::write(&probe, b"readyz").await {
            return Ok(HealthStatus::unhealthy(format!("could not write probe: {e}")));
        }
        let status = match fs::read(&probe).await {
            Ok(bytes) if bytes == b"readyz" => HealthStatus::healthy(),
            Ok(_) => HealthStatus::unhealthy("probe content mismatch"),
            Err(e) => HealthStatus::unhealthy(format!("could not read probe: {e}")),
        };
        let _ = fs::remove_file(&probe).await;
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{bytes_stream, read_all};
    use tempfile::TempDir;

    #[tokio::test]
    async fn round_trip_range_and_idempotent_delete() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::new(dir.path());
        let payload = Bytes::from_static(b"I am a body");

        let stored = backend
            .put(bytes_stream(payload.clone()), Some(11), &PutHints::default())
            .await
            .unwrap();
        assert_eq!(stored.key.len(), KEY_LEN);
        assert_eq!(stored.md5_hex, "be747eb4b75517bf6b3cf7c5fbb62f3a");

        let read = read_all(backend.get(&stored.key, None).await.unwrap())
            .await
            .unwrap();
        assert_eq!(read, payload);

        let head = read_all(
            backend
                .get(&stored.key, Some(ByteRange::new(0, 3)))
                .await
                .unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(&head[..], b"I am");

        backend.delete(&stored.key).await.unwrap();
        backend.delete(&stored.key).await.unwrap();
        let err = backend.get(&stored.key, None).await.err().unwrap();
        assert!(err.is_not_found());
        // shard directories are pruned with the last payload
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn rejects_keys_that_could_escape_the_base_path() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::new(dir.path());
        let err = backend.get("../../etc/passwd", None).await.err().unwrap();
        assert!(matches!(err, BackendError::InvalidKey(_)));
    }

    #[tokio::test]
    async fn healthcheck_reports_writable_directory() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::new(dir.path().join("objects"));
        assert!(backend.healthcheck().await.unwrap().ok);
    }
}
