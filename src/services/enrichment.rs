//! Feeds newly written objects to an indexing service and writes the labels
//! it returns back onto the object as tags.
//!
//! An upload stream is split with [`tee_stream`]: the backend write reads one
//! branch, the indexer the other. Each branch has its own bounded channel and
//! only the backend branch applies back-pressure to the source; an indexer
//! that falls behind loses its branch instead of stalling the upload.
//!
//! Each indexed object is driven by an [`EnrichmentTask`], a small state
//! machine that submits the bytes, polls until the indexer is done, waits for
//! the object write to be committed and finally records the labels as
//! `indexer{N}` tags through the metadata gateway.

use crate::{
    backends::ByteStream,
    errors::{PlacementError, PlacementResult},
    models::{location::IndexerConfig, object::DataLocation},
    services::metadata::{MdOptions, ObjectMetadataGateway},
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::{Body, Client};
use serde::Deserialize;
use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use thiserror::Error;
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    oneshot,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const TAG_PREFIX: &str = "indexer";

/// Split `source` into two streams carrying the same chunks.
///
/// The first branch is fed with `send().await` and so paces the source. The
/// second is fed with `try_send`; once its buffer is full it is cut off and
/// ends with an error rather than a silently short payload.
pub fn tee_stream(mut source: ByteStream, capacity: usize) -> (ByteStream, ByteStream) {
    let (primary_tx, primary_rx) = mpsc::channel::<io::Result<Bytes>>(capacity);
    let (secondary_tx, secondary_rx) = mpsc::channel::<io::Result<Bytes>>(capacity);
    let primary_done = Arc::new(AtomicBool::new(false));
    let secondary_done = Arc::new(AtomicBool::new(false));
    let (pump_primary_done, pump_secondary_done) = (primary_done.clone(), secondary_done.clone());

    tokio::spawn(async move {
        let mut secondary = Some(secondary_tx);
        while let Some(item) = source.next().await {
            if let Some(tx) = &secondary {
                let copy = match &item {
                    Ok(chunk) => Ok(chunk.clone()),
                    Err(err) => Err(io::Error::new(err.kind(), err.to_string())),
                };
                match tx.try_send(copy) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        debug!("secondary branch full; detaching it");
                        secondary = None;
                    }
                    Err(TrySendError::Closed(_)) => secondary = None,
                }
            }
            let failed = item.is_err();
            if primary_tx.send(item).await.is_err() || failed {
                return;
            }
        }
        pump_primary_done.store(true, Ordering::SeqCst);
        if secondary.is_some() {
            pump_secondary_done.store(true, Ordering::SeqCst);
        }
    });

    (
        guarded_branch(primary_rx, primary_done),
        guarded_branch(secondary_rx, secondary_done),
    )
}

/// Receiver side of a tee branch. A channel that closes before its branch was
/// fed the whole source yields a final error.
fn guarded_branch(rx: mpsc::Receiver<io::Result<Bytes>>, complete: Arc<AtomicBool>) -> ByteStream {
    Box::pin(stream::unfold(
        (rx, complete, false),
        |(mut rx, complete, done)| async move {
            if done {
                return None;
            }
            match rx.recv().await {
                Some(item) => Some((item, (rx, complete, false))),
                None if complete.load(Ordering::SeqCst) => None,
                None => Some((
                    Err(io::Error::other("stream branch was cut off before the end")),
                    (rx, complete, true),
                )),
            }
        },
    ))
}

#[derive(Debug, Error)]
pub enum IndexerError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("indexer answered with status {0}")]
    Status(u16),
}

/// Outcome of one status poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexerPoll {
    Processing,
    Finished { labels: Vec<String> },
    Failed(String),
}

#[async_trait]
pub trait Indexer: Send + Sync {
    /// Upload the object bytes. Returns the indexer's job id.
    async fn submit(&self, name: &str, body: ByteStream) -> Result<String, IndexerError>;

    async fn poll(&self, job_id: &str) -> Result<IndexerPoll, IndexerError>;
}

/// Indexer reached over a plain HTTP/JSON webhook.
///
/// `POST {endpoint}/jobs?name=..` streaming the raw bytes returns `{"id": ..}`;
/// `GET {endpoint}/jobs/{id}` returns `{"state": .., "labels": [..]}`.
pub struct HttpIndexer {
    client: Client,
    endpoint: String,
}

#[derive(Deserialize)]
struct SubmitResponse {
    id: String,
}

#[derive(Deserialize)]
struct JobStatus {
    state: String,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    error: Option<String>,
}

impl HttpIndexer {
    pub fn new(endpoint: &str) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: Client::builder().timeout(Duration::from_secs(60)).build()?,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Indexer for HttpIndexer {
    async fn submit(&self, name: &str, body: ByteStream) -> Result<String, IndexerError> {
        let url = format!(
            "{}/jobs?name={}",
            self.endpoint,
            utf8_percent_encode(name, NON_ALPHANUMERIC)
        );
        let resp = self
            .client
            .post(url)
            .body(Body::wrap_stream(body))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(IndexerError::Status(resp.status().as_u16()));
        }
        Ok(resp.json::<SubmitResponse>().await?.id)
    }

    async fn poll(&self, job_id: &str) -> Result<IndexerPoll, IndexerError> {
        let url = format!(
            "{}/jobs/{}",
            self.endpoint,
            utf8_percent_encode(job_id, NON_ALPHANUMERIC)
        );
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(IndexerError::Status(resp.status().as_u16()));
        }
        let status: JobStatus = resp.json().await?;
        Ok(match status.state.to_ascii_lowercase().as_str() {
            "uploaded" | "processing" => IndexerPoll::Processing,
            "failed" => IndexerPoll::Failed(status.error.unwrap_or(status.state)),
            _ => IndexerPoll::Finished {
                labels: status.labels,
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrichmentState {
    Submitting,
    Polling { job_id: String, attempt: u32 },
    Tagging { labels: Vec<String> },
    Done,
    Failed(String),
}

impl EnrichmentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }
}

pub struct EnrichmentTask {
    bucket: String,
    key: String,
    body: Option<ByteStream>,
    indexer: Arc<dyn Indexer>,
    metadata: Arc<dyn ObjectMetadataGateway>,
    poll_interval: Duration,
    max_polls: u32,
    committed: Option<oneshot::Receiver<Vec<DataLocation>>>,
    cancel: CancellationToken,
}

impl EnrichmentTask {
    /// Drive the task to `Done` or `Failed`.
    pub async fn run(mut self) -> EnrichmentState {
        let cancel = self.cancel.clone();
        let mut state = EnrichmentState::Submitting;
        while !state.is_terminal() {
            state = tokio::select! {
                biased;
                _ = cancel.cancelled() => EnrichmentState::Failed("cancelled".into()),
                next = self.step(state) => next,
            };
            debug!(bucket = %self.bucket, key = %self.key, state = ?state, "enrichment step");
        }
        match &state {
            EnrichmentState::Done => info!(bucket = %self.bucket, key = %self.key, "object tagged by indexer"),
            EnrichmentState::Failed(reason) => {
                warn!(bucket = %self.bucket, key = %self.key, reason = %reason, "enrichment failed")
            }
            _ => {}
        }
        state
    }

    async fn step(&mut self, state: EnrichmentState) -> EnrichmentState {
        match state {
            EnrichmentState::Submitting => {
                let Some(body) = self.body.take() else {
                    return EnrichmentState::Failed("payload already submitted".into());
                };
                let name = format!("{}/{}", self.bucket, self.key);
                match self.indexer.submit(&name, body).await {
                    Ok(job_id) => EnrichmentState::Polling { job_id, attempt: 0 },
                    Err(err) => EnrichmentState::Failed(format!("submit failed: {err}")),
                }
            }
            EnrichmentState::Polling { job_id, attempt } => {
                if attempt >= self.max_polls {
                    return EnrichmentState::Failed(format!("still processing after {attempt} polls"));
                }
                if attempt > 0 {
                    tokio::time::sleep(self.poll_interval).await;
                }
                match self.indexer.poll(&job_id).await {
                    Ok(IndexerPoll::Processing) => EnrichmentState::Polling {
                        job_id,
                        attempt: attempt + 1,
                    },
                    Ok(IndexerPoll::Finished { labels }) => EnrichmentState::Tagging { labels },
                    Ok(IndexerPoll::Failed(reason)) => EnrichmentState::Failed(reason),
                    Err(err) => EnrichmentState::Failed(format!("poll failed: {err}")),
                }
            }
            EnrichmentState::Tagging { labels } => {
                let committed = match self.committed.take() {
                    Some(rx) => rx.await.ok(),
                    None => None,
                };
                let Some(locations) = committed else {
                    return EnrichmentState::Failed("object write was not committed".into());
                };
                let metadata = self.metadata.clone();
                let (bucket, key) = (self.bucket.clone(), self.key.clone());
                match write_tags(metadata, bucket, key, locations, labels).await {
                    Ok(()) => EnrichmentState::Done,
                    Err(PlacementError::RecordChanged { .. } | PlacementError::NoSuchKey { .. }) => {
                        EnrichmentState::Failed("object was replaced before tagging".into())
                    }
                    Err(err) => EnrichmentState::Failed(format!("tagging failed: {err}")),
                }
            }
            terminal => terminal,
        }
    }

}

/// Read-modify-write of the record that was written with `locations`.
/// Fails with `RecordChanged` once the key holds a different write.
async fn write_tags(
    metadata: Arc<dyn ObjectMetadataGateway>,
    bucket: String,
    key: String,
    locations: Vec<DataLocation>,
    labels: Vec<String>,
) -> PlacementResult<()> {
    let mut record = metadata
        .get_object_md(&bucket, &key, &MdOptions::default())
        .await?;
    if record.locations.0 != locations {
        return Err(PlacementError::RecordChanged { bucket, key });
    }
    for (i, label) in labels.into_iter().enumerate() {
        record.tags.0.insert(format!("{TAG_PREFIX}{i}"), label);
    }
    let opts = MdOptions::in_place(record.version_id.clone(), locations);
    metadata.put_object_md(&bucket, &key, &record, &opts).await?;
    Ok(())
}

/// Ties a running task to the write that started it. Dropping the handle
/// without [`commit`](Self::commit) cancels the task.
pub struct EnrichmentHandle {
    cancel: CancellationToken,
    committed: Option<oneshot::Sender<Vec<DataLocation>>>,
}

impl EnrichmentHandle {
    /// The write landed at `locations`; tags go onto that record only.
    pub fn commit(mut self, locations: Vec<DataLocation>) {
        if let Some(tx) = self.committed.take() {
            let _ = tx.send(locations);
        }
    }
}

impl Drop for EnrichmentHandle {
    fn drop(&mut self) {
        if self.committed.is_some() {
            self.cancel.cancel();
        }
    }
}

pub struct Enricher {
    indexer: Arc<dyn Indexer>,
    metadata: Arc<dyn ObjectMetadataGateway>,
    poll_interval: Duration,
    max_polls: u32,
    content_types: Vec<String>,
    shutdown: CancellationToken,
}

impl Enricher {
    pub fn new(
        indexer: Arc<dyn Indexer>,
        metadata: Arc<dyn ObjectMetadataGateway>,
        config: &IndexerConfig,
    ) -> Self {
        Self {
            indexer,
            metadata,
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            max_polls: config.max_polls,
            content_types: config.content_types.clone(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Whether uploads of this content type are indexed.
    pub fn wants(&self, content_type: Option<&str>) -> bool {
        content_type.is_some_and(|ct| {
            self.content_types
                .iter()
                .any(|prefix| ct.starts_with(prefix.as_str()))
        })
    }

    pub fn task(
        &self,
        bucket: &str,
        key: &str,
        body: ByteStream,
    ) -> (EnrichmentTask, EnrichmentHandle) {
        let cancel = self.shutdown.child_token();
        let (tx, rx) = oneshot::channel();
        let task = EnrichmentTask {
            bucket: bucket.to_string(),
            key: key.to_string(),
            body: Some(body),
            indexer: self.indexer.clone(),
            metadata: self.metadata.clone(),
            poll_interval: self.poll_interval,
            max_polls: self.max_polls,
            committed: Some(rx),
            cancel: cancel.clone(),
        };
        let handle = EnrichmentHandle {
            cancel,
            committed: Some(tx),
        };
        (task, handle)
    }

    /// Spawn a task for `body` and return the handle that commits or cancels it.
    pub fn start(&self, bucket: &str, key: &str, body: ByteStream) -> EnrichmentHandle {
        let (task, handle) = self.task(bucket, key, body);
        tokio::spawn(task.run());
        handle
    }

    /// Cancel every running task.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
