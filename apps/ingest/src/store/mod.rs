use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::db::IngestDb;

mod memory;
mod postgres;
mod types;

pub use types::{CollectedPage, InjectionRequest, PayloadFireResult};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("db error: {0}")]
    Db(String),
}

/// Persistence seam for settings, correlation records and evidence.
///
/// Implementations provide their own concurrency control; callers never hold
/// additional locks around these calls.
#[async_trait]
pub trait IngestStore: Send + Sync {
    /// Round trip to the backing engine; used by the health endpoint.
    async fn ping(&self) -> Result<(), StoreError>;

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Insert or overwrite.
    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Atomically inserts the setting unless the key already exists.
    /// Returns `true` only when this call created the row.
    async fn create_setting_if_absent(&self, key: &str, value: &str) -> Result<bool, StoreError>;

    async fn find_injection_request(
        &self,
        injection_key: &str,
    ) -> Result<Option<InjectionRequest>, StoreError>;

    async fn create_injection_request(&self, request: InjectionRequest) -> Result<(), StoreError>;

    async fn create_fire_result(&self, record: PayloadFireResult) -> Result<(), StoreError>;

    async fn find_fire_result(&self, id: Uuid) -> Result<Option<PayloadFireResult>, StoreError>;

    /// Newest first.
    async fn list_fire_results(&self, limit: usize) -> Result<Vec<PayloadFireResult>, StoreError>;

    async fn create_collected_page(&self, page: CollectedPage) -> Result<(), StoreError>;

    /// Newest first.
    async fn list_collected_pages(&self, limit: usize) -> Result<Vec<CollectedPage>, StoreError>;
}

pub fn memory() -> Arc<dyn IngestStore> {
    Arc::new(memory::MemoryIngestStore::default())
}

pub fn postgres(db: Arc<IngestDb>) -> Arc<dyn IngestStore> {
    Arc::new(postgres::PostgresIngestStore::new(db))
}
