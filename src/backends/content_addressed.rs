//! Client for a content-addressed cluster reached over HTTP.
//!
//! Each payload is stored under a generated key at
//! `http://{member}/{path}/{key}`. Members from the bootstrap list are tried
//! in turn, starting from a rotating offset; a member that cannot be reached
//! is skipped, an HTTP answer of any status is final.

use super::{
    BackendClient, BackendError, BackendResult, ByteRange, ByteStream, HealthStatus, PutHints,
    StoredPayload, bytes_stream, collect_with_md5,
};
use crate::models::location::{LocationKind, SproxydDetails};
use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode, header};
use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};
use tracing::{debug, warn};
use uuid::Uuid;

const DEFAULT_PATH: &str = "proxy/arc";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PLACEMENT_CLASS_HEADER: &str = "x-scal-placement-class";

#[derive(Debug)]
pub struct ContentAddressedBackend {
    client: Client,
    bootstrap: Vec<String>,
    path: String,
    placement_class: Option<u8>,
    next_member: AtomicUsize,
}

impl ContentAddressedBackend {
    pub fn new(details: &SproxydDetails) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let path = details
            .path
            .as_deref()
            .unwrap_or(DEFAULT_PATH)
            .trim_matches('/')
            .to_string();
        Ok(Self {
            client,
            bootstrap: details.bootstrap.clone(),
            path,
            placement_class: details.chord_cos,
            next_member: AtomicUsize::new(0),
        })
    }

    fn key_url(&self, member: &str, key: &str) -> String {
        format!("http://{}/{}/{}", member, self.path, key)
    }

    /// Content-addressed keys are generated here as 32 hex digits.
    fn ensure_key_safe(key: &str) -> BackendResult<()> {
        if !key.is_empty() && key.bytes().all(|b| b.is_ascii_hexdigit()) {
            Ok(())
        } else {
            Err(BackendError::InvalidKey(key.to_string()))
        }
    }

    /// Send a request to the first reachable bootstrap member.
    async fn send<F>(&self, build: F) -> BackendResult<Response>
    where
        F: Fn(&str) -> RequestBuilder,
    {
        let start = self.next_member.fetch_add(1, Ordering::Relaxed);
        let mut last_err = None;
        for offset in 0..self.bootstrap.len() {
            let member = &self.bootstrap[(start + offset) % self.bootstrap.len()];
            match build(member).send().await {
                Ok(resp) => return Ok(resp),
                Err(err) if err.is_connect() || err.is_timeout() => {
                    warn!(member = %member, error = %err, "cluster member unreachable");
                    last_err = Some(err);
                }
                Err(err) => return Err(BackendError::Http(err)),
            }
        }
        Err(match last_err {
            Some(err) => BackendError::Http(err),
            None => BackendError::Remote {
                status: 0,
                message: "bootstrap list is empty".into(),
            },
        })
    }

    async fn remote_error(resp: Response) -> BackendError {
        let status = resp.status().as_u16();
        let message = resp.text().await.unwrap_or_default();
        BackendError::Remote { status, message }
    }
}

#[async_trait]
impl BackendClient for ContentAddressedBackend {
    fn kind(&self) -> LocationKind {
        LocationKind::ContentAddressed
    }

    async fn put(
        &self,
        stream: ByteStream,
        _size_hint: Option<u64>,
        hints: &PutHints,
    ) -> BackendResult<StoredPayload> {
        let (data, md5_hex) = collect_with_md5(stream).await?;
        let key = Uuid::new_v4().simple().to_string().to_uppercase();
        let resp = self
            .send(|member| {
                let mut req = self
                    .client
                    .put(self.key_url(member, &key))
                    .header(header::CONTENT_LENGTH, data.len())
                    .body(data.clone());
                if let Some(class) = self.placement_class {
                    req = req.header(PLACEMENT_CLASS_HEADER, class.to_string());
                }
                req
            })
            .await?;
        if !resp.status().is_success() {
            return Err(Self::remote_error(resp).await);
        }
        debug!(key = %key, bucket = %hints.bucket, object = %hints.key, "stored payload in cluster");
        Ok(StoredPayload {
            key,
            size: data.len() as u64,
            md5_hex,
        })
    }

    async fn get(&self, key: &str, range: Option<ByteRange>) -> BackendResult<ByteStream> {
        Self::ensure_key_safe(key)?;
        let resp = self
            .send(|member| {
                let req = self.client.get(self.key_url(member, key));
                match range {
                    Some(r) => req.header(header::RANGE, format!("bytes={}-{}", r.start, r.end)),
                    None => req,
                }
            })
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Err(BackendError::NotFound(key.to_string())),
            StatusCode::RANGE_NOT_SATISFIABLE => Ok(bytes_stream(bytes::Bytes::new())),
            status if status.is_success() => {
                Ok(Box::pin(resp.bytes_stream().map_err(std::io::Error::other)))
            }
            _ => Err(Self::remote_error(resp).await),
        }
    }

    /// Unknown keys fail with `NotFound`; the cluster does not treat deletes as idempotent.
    async fn delete(&self, key: &str) -> BackendResult<()> {
        Self::ensure_key_safe(key)?;
        let resp = self
            .send(|member| self.client.delete(self.key_url(member, key)))
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Err(BackendError::NotFound(key.to_string())),
            status if status.is_success() => Ok(()),
            _ => Err(Self::remote_error(resp).await),
        }
    }

    async fn healthcheck(&self) -> BackendResult<HealthStatus> {
        let resp = match self
            .send(|member| self.client.get(format!("http://{}/.conf", member)))
            .await
        {
            Ok(resp) => resp,
            Err(err) => return Ok(HealthStatus::unhealthy(err.to_string())),
        };
        if resp.status().is_success() {
            Ok(HealthStatus::healthy())
        } else {
            Ok(HealthStatus::unhealthy(format!(
                "cluster answered {}",
                resp.status()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::read_all;
    use axum::{
        Router,
        body::Bytes,
        extract::{Path, State},
        http::{HeaderMap, StatusCode as AxumStatus},
        routing::{get, put},
    };
    use parking_lot::Mutex;
    use std::{collections::HashMap, sync::Arc};
    use tokio::net::TcpListener;

    type Store = Arc<Mutex<HashMap<String, Bytes>>>;

    async fn fake_put(State(store): State<Store>, Path(key): Path<String>, body: Bytes) -> AxumStatus {
        store.lock().insert(key, body);
        AxumStatus::OK
    }

    async fn fake_get(
        State(store): State<Store>,
        Path(key): Path<String>,
        headers: HeaderMap,
    ) -> Result<Bytes, AxumStatus> {
        let data = store.lock().get(&key).cloned().ok_or(AxumStatus::NOT_FOUND)?;
        let range = headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("bytes="))
            .and_then(|v| v.split_once('-'))
            .and_then(|(a, b)| Some((a.parse::<usize>().ok()?, b.parse::<usize>().ok()?)));
        Ok(match range {
            Some((start, end)) => data.slice(start..=end.min(data.len() - 1)),
            None => data,
        })
    }

    async fn fake_delete(State(store): State<Store>, Path(key): Path<String>) -> AxumStatus {
        match store.lock().remove(&key) {
            Some(_) => AxumStatus::OK,
            None => AxumStatus::NOT_FOUND,
        }
    }

    async fn spawn_fake_cluster() -> (String, Store) {
        let store: Store = Arc::default();
        let app = Router::new()
            .route("/.conf", get(|| async { "{}" }))
            .route(
                "/proxy/arc/{key}",
                put(fake_put).get(fake_get).delete(fake_delete),
            )
            .layer(axum::extract::DefaultBodyLimit::disable())
            .with_state(store.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, store)
    }

    fn backend_for(bootstrap: Vec<String>) -> ContentAddressedBackend {
        ContentAddressedBackend::new(&SproxydDetails {
            bootstrap,
            chord_cos: None,
            path: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn round_trip_and_strict_delete() {
        let (addr, store) = spawn_fake_cluster().await;
        let backend = backend_for(vec![addr]);
        let payload = bytes::Bytes::from_static(b"I am a body");

        let stored = backend
            .put(bytes_stream(payload.clone()), Some(11), &PutHints::default())
            .await
            .unwrap();
        assert_eq!(store.lock().len(), 1);

        let read = read_all(backend.get(&stored.key, None).await.unwrap())
            .await
            .unwrap();
        assert_eq!(read, payload);
        let tail = read_all(
            backend
                .get(&stored.key, Some(ByteRange::new(5, 10)))
                .await
                .unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(&tail[..], b"a body");

        backend.delete(&stored.key).await.unwrap();
        assert!(backend.delete(&stored.key).await.unwrap_err().is_not_found());
        assert!(backend.get(&stored.key, None).await.err().unwrap().is_not_found());
    }

    #[tokio::test]
    async fn large_payloads_are_read_as_a_stream() {
        use futures::StreamExt;

        let (addr, _store) = spawn_fake_cluster().await;
        let backend = backend_for(vec![addr]);
        let payload = bytes::Bytes::from(vec![7u8; 4 * 1024 * 1024]);
        let stored = backend
            .put(bytes_stream(payload.clone()), None, &PutHints::default())
            .await
            .unwrap();

        let mut body = backend.get(&stored.key, None).await.unwrap();
        let mut chunks = 0;
        let mut total = 0;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.unwrap();
            assert!(chunk.len() < payload.len());
            total += chunk.len();
            chunks += 1;
        }
        assert_eq!(total, payload.len());
        assert!(chunks > 1);
    }

    #[tokio::test]
    async fn skips_unreachable_bootstrap_members() {
        let (addr, _store) = spawn_fake_cluster().await;
        // bind then drop to obtain a port nobody listens on
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap().to_string();
        drop(dead);

        let backend = backend_for(vec![dead_addr, addr]);
        for _ in 0..2 {
            let stored = backend
                .put(bytes_stream("x".into()), None, &PutHints::default())
                .await
                .unwrap();
            assert_eq!(stored.size, 1);
        }
        assert!(backend.healthcheck().await.unwrap().ok);
    }
}
