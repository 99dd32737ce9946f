pub mod backend_info;
pub mod enrichment;
pub mod metadata;
pub mod multipart_service;
pub mod registry;
pub mod storage_service;

use self::{
    multipart_service::MultipartService, registry::LocationRegistry,
    storage_service::StorageService,
};
use sqlx::SqlitePool;
use std::sync::Arc;

/// State shared by every handler: the location registry, the metadata pool
/// and the services built over them.
#[derive(Clone)]
pub struct AppContext {
    pub db: Arc<SqlitePool>,
    pub registry: Arc<LocationRegistry>,
    pub storage: StorageService,
    pub multipart: MultipartService,
}

impl AppContext {
    pub fn new(storage: StorageService) -> Self {
        let db = storage.db.clone();
        let registry = storage.registry().clone();
        let multipart = MultipartService::new(db.clone(), storage.clone());
        Self {
            db,
            registry,
            storage,
            multipart,
        }
    }
}
