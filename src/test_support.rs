//! Shared fixtures for the unit tests.

use crate::{
    backends::{
        BackendClient, BackendResult, ByteRange, ByteStream, HealthStatus, PutHints,
        StoredPayload, file::FileBackend, memory::MemoryBackend,
    },
    models::location::LocationKind,
    services::{
        AppContext,
        metadata::{SqliteMetadata, run_migrations},
        registry::{BuiltinBackends, LocationRegistry},
        storage_service::StorageService,
    },
};
use async_trait::async_trait;
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};
use tempfile::TempDir;

/// In-memory SQLite with the schema applied. A single connection keeps every
/// query on the same database.
pub async fn memory_pool() -> Arc<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    run_migrations(&pool).await.unwrap();
    Arc::new(pool)
}

/// Backends and registry for the usual `mem` / `file` layout, with
/// `localhost` mapped to `file`.
pub struct Fixture {
    pub dir: TempDir,
    pub builtins: BuiltinBackends,
    pub registry: Arc<LocationRegistry>,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let builtins = BuiltinBackends {
            memory: Arc::new(MemoryBackend::new()),
            file: Arc::new(FileBackend::new(dir.path().join("objects"))),
        };
        let config = serde_json::from_str(
            r#"{
                "locationConstraints": {
                    "mem": { "type": "mem", "details": {} },
                    "file": { "type": "file", "details": {} }
                },
                "restEndpoints": { "localhost": "file", "127.0.0.1": "file" }
            }"#,
        )
        .unwrap();
        let registry = Arc::new(LocationRegistry::build(&config, &builtins).unwrap());
        Self {
            dir,
            builtins,
            registry,
        }
    }

    pub fn arena_len(&self) -> usize {
        self.builtins.memory.arena().len()
    }
}

/// Handler state over a fresh in-memory database and the fixture's registry.
pub async fn app_context(fixture: &Fixture) -> AppContext {
    let db = memory_pool().await;
    let metadata = Arc::new(SqliteMetadata::new(db.clone()));
    AppContext::new(StorageService::new(db, metadata, fixture.registry.clone()))
}

/// Wraps a backend and counts the calls that reach it.
pub struct CountingBackend {
    inner: MemoryBackend,
    pub puts: AtomicUsize,
    pub gets: AtomicUsize,
    pub deletes: AtomicUsize,
}

impl CountingBackend {
    pub fn new() -> Self {
        Self {
            inner: MemoryBackend::new(),
            puts: AtomicUsize::new(0),
            gets: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
            + self.gets.load(Ordering::SeqCst)
            + self.deletes.load(Ordering::SeqCst)
    }

    pub fn live_payloads(&self) -> usize {
        self.inner.arena().live_count()
    }

    /// Registry holding only this backend under `name`.
    pub fn registry(self: &Arc<Self>, name: &str) -> Arc<LocationRegistry> {
        let client: Arc<dyn BackendClient> = self.clone();
        Arc::new(LocationRegistry::from_clients(
            [(name.to_string(), client)],
            BTreeMap::from([("localhost".to_string(), name.to_string())]),
        ))
    }
}

#[async_trait]
impl BackendClient for CountingBackend {
    fn kind(&self) -> LocationKind {
        LocationKind::Memory
    }

    async fn put(
        &self,
        stream: ByteStream,
        size_hint: Option<u64>,
        hints: &PutHints,
    ) -> BackendResult<StoredPayload> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(stream, size_hint, hints).await
    }

    async fn get(&self, key: &str, range: Option<ByteRange>) -> BackendResult<ByteStream> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key, range).await
    }

    async fn delete(&self, key: &str) -> BackendResult<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(key).await
    }

    async fn healthcheck(&self) -> BackendResult<HealthStatus> {
        Ok(HealthStatus::healthy())
    }
}
