//! In-memory backend over an append-only data arena.

use super::{
    BackendClient, BackendError, BackendResult, ByteRange, ByteStream, HealthStatus, PutHints,
    StoredPayload, bytes_stream, clamp_range, collect_with_md5,
};
use crate::models::location::LocationKind;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::trace;

/// Append-only sequence of payloads with stable 1-based keys.
///
/// Keys are handed out under the lock so two writers never share one.
/// Removing an entry leaves a tombstone; slots are never reused or renumbered.
#[derive(Debug, Default)]
pub struct DataArena {
    entries: Mutex<Vec<Option<Bytes>>>,
}

impl DataArena {
    pub fn append(&self, value: Bytes) -> u64 {
        let mut entries = self.entries.lock();
        entries.push(Some(value));
        entries.len() as u64
    }

    pub fn get(&self, key: u64) -> Option<Bytes> {
        let index = usize::try_from(key).ok()?.checked_sub(1)?;
        self.entries.lock().get(index).cloned().flatten()
    }

    /// Tombstone the entry. Returns whether a live payload was removed.
    pub fn remove(&self, key: u64) -> bool {
        let Some(index) = usize::try_from(key).ok().and_then(|k| k.checked_sub(1)) else {
            return false;
        };
        self.entries
            .lock()
            .get_mut(index)
            .and_then(Option::take)
            .is_some()
    }

    /// Number of slots ever assigned, tombstones included.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn live_count(&self) -> usize {
        self.entries.lock().iter().filter(|e| e.is_some()).count()
    }
}

/// Backend keeping payloads in process memory. Shared by every `mem` location.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    arena: DataArena,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arena(&self) -> &DataArena {
        &self.arena
    }

    fn parse_key(key: &str) -> BackendResult<u64> {
        match key.parse::<u64>() {
            Ok(k) if k > 0 => Ok(k),
            _ => Err(BackendError::InvalidKey(key.to_string())),
        }
    }
}

#[async_trait]
impl BackendClient for MemoryBackend {
    fn kind(&self) -> LocationKind {
        LocationKind::Memory
    }

    async fn put(
        &self,
        stream: ByteStream,
        _size_hint: Option<u64>,
        _hints: &PutHints,
    ) -> BackendResult<StoredPayload> {
        let (data, md5_hex) = collect_with_md5(stream).await?;
        let size = data.len() as u64;
        let key = self.arena.append(data);
        trace!(key, size, "appended data entry");
        Ok(StoredPayload {
            key: key.to_string(),
            size,
            md5_hex,
        })
    }

    async fn get(&self, key: &str, range: Option<ByteRange>) -> BackendResult<ByteStream> {
        let data = self
            .arena
            .get(Self::parse_key(key)?)
            .ok_or_else(|| BackendError::NotFound(key.to_string()))?;
        let data = match range {
            None => data,
            Some(range) => match clamp_range(range, data.len() as u64) {
                Some(r) => data.slice(r.start as usize..=r.end as usize),
                None => Bytes::new(),
            },
        };
        Ok(bytes_stream(data))
    }

    async fn delete(&self, key: &str) -> BackendResult<()> {
        let removed = self.arena.remove(Self::parse_key(key)?);
        trace!(key, removed, "deleted data entry");
        Ok(())
    }

    async fn healthcheck(&self) -> BackendResult<HealthStatus> {
        Ok(HealthStatus::healthy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::read_all;

    #[test]
    fn arena_keys_are_monotonic_and_never_reused() {
        let arena = DataArena::default();
        assert_eq!(arena.append(Bytes::from_static(b"a")), 1);
        assert_eq!(arena.append(Bytes::from_static(b"b")), 2);
        assert!(arena.remove(1));
        assert!(!arena.remove(1));
        assert_eq!(arena.append(Bytes::from_static(b"c")), 3);
        assert_eq!(arena.len(), 3);
        assert_eq!(arena.live_count(), 2);
        assert_eq!(arena.get(1), None);
        assert_eq!(arena.get(2), Some(Bytes::from_static(b"b")));
        assert_eq!(arena.get(0), None);
    }

    #[test]
    fn concurrent_appends_get_distinct_keys() {
        use std::{collections::HashSet, sync::Arc, thread};

        let arena = Arc::new(DataArena::default());
        let writers: Vec<_> = (0..8)
            .map(|t| {
                let arena = arena.clone();
                thread::spawn(move || {
                    (0..100)
                        .map(|i| arena.append(Bytes::from(format!("{t}-{i}"))))
                        .collect::<Vec<u64>>()
                })
            })
            .collect();
        let keys: Vec<u64> = writers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect();

        let unique: HashSet<u64> = keys.iter().copied().collect();
        assert_eq!(unique.len(), 800);
        assert_eq!(unique, (1..=800).collect::<HashSet<u64>>());
        assert_eq!(arena.live_count(), 800);
    }

    #[tokio::test]
    async fn round_trip_then_idempotent_delete() {
        let backend = MemoryBackend::new();
        let payload = Bytes::from_static(b"I am a body");
        let stored = backend
            .put(bytes_stream(payload.clone()), None, &PutHints::default())
            .await
            .unwrap();
        assert_eq!(stored.key, "1");
        assert_eq!(stored.size, 11);

        let read = read_all(backend.get(&stored.key, None).await.unwrap())
            .await
            .unwrap();
        assert_eq!(read, payload);

        let ranged = read_all(
            backend
                .get(&stored.key, Some(ByteRange::new(5, 10)))
                .await
                .unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(&ranged[..], b"a body");

        backend.delete(&stored.key).await.unwrap();
        backend.delete(&stored.key).await.unwrap();
        let err = backend.get(&stored.key, None).await.err().unwrap();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn malformed_keys_are_rejected() {
        let backend = MemoryBackend::new();
        let err = backend.get("not-a-number", None).await.err().unwrap();
        assert!(matches!(err, BackendError::InvalidKey(_)));
        assert!(backend.delete("0").await.is_err());
    }
}
