//! Storage backends behind a single capability set.
//!
//! Every backend implements [`BackendClient`]: `put` a byte stream and get
//! back the storage key it assigned, `get` (optionally a byte range) by key,
//! `delete` by key and `healthcheck`. Which backend serves a write is decided
//! elsewhere; backends never see location names.

pub mod content_addressed;
pub mod file;
pub mod memory;

use crate::models::location::LocationKind;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, stream};
use md5::Context;
use serde::Serialize;
use std::{io, pin::Pin};
use thiserror::Error;

/// Owned, sendable stream of payload chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("storage key `{0}` not found")]
    NotFound(String),
    #[error("storage key `{0}` is malformed")]
    InvalidKey(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("remote responded with status {status}: {message}")]
    Remote { status: u16, message: String },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl BackendError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Inclusive byte range within a stored payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Hints a backend may use when storing a payload. None of them is required.
#[derive(Debug, Clone, Default)]
pub struct PutHints {
    pub bucket: String,
    pub key: String,
    pub content_type: Option<String>,
}

/// What a backend reports after persisting a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPayload {
    /// Backend-assigned storage key.
    pub key: String,
    pub size: u64,
    /// Hex MD5 of the bytes written.
    pub md5_hex: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub ok: bool,
    pub detail: Option<String>,
}

impl HealthStatus {
    pub fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Kind of backend, fixed when the registry is built.
    fn kind(&self) -> LocationKind;

    /// Persist the whole stream and return the key it can be read back with.
    async fn put(
        &self,
        stream: ByteStream,
        size_hint: Option<u64>,
        hints: &PutHints,
    ) -> BackendResult<StoredPayload>;

    /// Stream a stored payload, or the part of it covered by `range`.
    async fn get(&self, key: &str, range: Option<ByteRange>) -> BackendResult<ByteStream>;

    /// Remove a stored payload.
    async fn delete(&self, key: &str) -> BackendResult<()>;

    async fn healthcheck(&self) -> BackendResult<HealthStatus>;
}

/// Wrap an in-memory buffer as a single-chunk stream.
pub fn bytes_stream(data: Bytes) -> ByteStream {
    Box::pin(stream::once(async move { Ok(data) }))
}

/// Drain a stream into one buffer, computing its MD5 on the way.
pub async fn collect_with_md5(mut stream: ByteStream) -> io::Result<(Bytes, String)> {
    let mut buf = BytesMut::new();
    let mut digest = Context::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        digest.consume(&chunk);
        buf.extend_from_slice(&chunk);
    }
    Ok((buf.freeze(), format!("{:x}", digest.compute())))
}

/// Drain a stream into one buffer.
#[cfg(test)]
pub async fn read_all(stream: ByteStream) -> io::Result<Bytes> {
    collect_with_md5(stream).await.map(|(data, _)| data)
}

/// Clamp `range` to a payload of `len` bytes. `None` when nothing overlaps.
pub(crate) fn clamp_range(range: ByteRange, len: u64) -> Option<ByteRange> {
    if len == 0 || range.start >= len || range.start > range.end {
        return None;
    }
    Some(ByteRange::new(range.start, range.end.min(len - 1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collect_with_md5_concatenates_chunks() {
        let chunks = vec![
            Ok(Bytes::from_static(b"I am ")),
            Ok(Bytes::from_static(b"a body")),
        ];
        let stream: ByteStream = Box::pin(stream::iter(chunks));
        let (data, md5_hex) = collect_with_md5(stream).await.unwrap();
        assert_eq!(&data[..], b"I am a body");
        assert_eq!(md5_hex, "be747eb4b75517bf6b3cf7c5fbb62f3a");
    }

    #[test]
    fn clamp_range_trims_to_payload() {
        assert_eq!(
            clamp_range(ByteRange::new(2, 100), 10),
            Some(ByteRange::new(2, 9))
        );
        assert_eq!(clamp_range(ByteRange::new(10, 12), 10), None);
        assert_eq!(clamp_range(ByteRange::new(0, 0), 0), None);
    }
}
