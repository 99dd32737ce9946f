use anyhow::{Context, Result};
use axum::Router;
use sqlx::sqlite::SqlitePoolOptions;
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod backends;
mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
#[cfg(test)]
mod test_support;

use backends::{file::FileBackend, memory::MemoryBackend};
use services::{
    AppContext,
    enrichment::{Enricher, HttpIndexer},
    metadata::{SqliteMetadata, run_migrations},
    registry::{BuiltinBackends, LocationRegistry},
    storage_service::StorageService,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting placement gateway with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    // sqlx does not create missing parent directories or the file itself
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }
    if let Err(e) = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(db_path)
    {
        tracing::warn!("Failed to open database file manually: {}", e);
    }

    let db: Arc<sqlx::Pool<sqlx::Sqlite>> = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await
            .with_context(|| format!("connecting to {db_url}"))?,
    );

    // --- Schema (idempotent); migration mode stops here ---
    run_migrations(&db).await?;
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    // --- Placement registry ---
    let locations = cfg.load_locations()?;
    let builtins = BuiltinBackends {
        memory: Arc::new(MemoryBackend::new()),
        file: Arc::new(FileBackend::new(&cfg.storage_dir)),
    };
    let registry = LocationRegistry::build(&locations, &builtins).map_err(|err| {
        tracing::error!(error = %err, "invalid location configuration");
        err
    });
    let registry = Arc::new(
        registry.with_context(|| format!("building locations from {}", cfg.location_config))?,
    );
    tracing::info!(mode = ?registry.mode(), "placement registry ready");

    // --- Initialize core services ---
    let metadata = Arc::new(SqliteMetadata::new(db.clone()));
    let mut storage = StorageService::new(db.clone(), metadata.clone(), registry);
    let enricher = match &locations.indexer {
        Some(indexer_cfg) => {
            let indexer = HttpIndexer::new(&indexer_cfg.endpoint)
                .with_context(|| format!("building indexer client for {}", indexer_cfg.endpoint))?;
            tracing::info!(endpoint = %indexer_cfg.endpoint, "indexing enabled");
            let enricher = Arc::new(Enricher::new(Arc::new(indexer), metadata, indexer_cfg));
            storage = storage.with_enricher(enricher.clone());
            Some(enricher)
        }
        None => None,
    };

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(AppContext::new(storage));

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown signal received");
        })
        .await?;

    if let Some(enricher) = enricher {
        enricher.shutdown();
    }
    Ok(())
}
