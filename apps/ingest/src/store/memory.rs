use std::collections::HashMap;
use std::collections::hash_map::Entry;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{CollectedPage, IngestStore, InjectionRequest, PayloadFireResult, StoreError};

#[derive(Default)]
pub(super) struct MemoryIngestStore {
    inner: Mutex<MemoryIngestStoreInner>,
}

#[derive(Default)]
struct MemoryIngestStoreInner {
    settings: HashMap<String, String>,
    injection_requests_by_key: HashMap<String, InjectionRequest>,
    fire_results: Vec<PayloadFireResult>,
    collected_pages: Vec<CollectedPage>,
}

#[async_trait]
impl IngestStore for MemoryIngestStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.settings.get(key).cloned())
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.settings.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn create_setting_if_absent(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.settings.entry(key.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(value.to_string());
                Ok(true)
            }
        }
    }

    async fn find_injection_request(
        &self,
        injection_key: &str,
    ) -> Result<Option<InjectionRequest>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.injection_requests_by_key.get(injection_key).cloned())
    }

    async fn create_injection_request(&self, request: InjectionRequest) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        match inner
            .injection_requests_by_key
            .entry(request.injection_key.clone())
        {
            Entry::Occupied(_) => Err(StoreError::Conflict(
                "injection_key already issued".to_string(),
            )),
            Entry::Vacant(slot) => {
                slot.insert(request);
                Ok(())
            }
        }
    }

    async fn create_fire_result(&self, record: PayloadFireResult) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.fire_results.iter().any(|row| row.id == record.id) {
            return Err(StoreError::Conflict("fire result id already exists".to_string()));
        }
        inner.fire_results.push(record);
        Ok(())
    }

    async fn find_fire_result(&self, id: Uuid) -> Result<Option<PayloadFireResult>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.fire_results.iter().find(|row| row.id == id).cloned())
    }

    async fn list_fire_results(&self, limit: usize) -> Result<Vec<PayloadFireResult>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.fire_results.iter().rev().take(limit).cloned().collect())
    }

    async fn create_collected_page(&self, page: CollectedPage) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.collected_pages.push(page);
        Ok(())
    }

    async fn list_collected_pages(&self, limit: usize) -> Result<Vec<CollectedPage>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .collected_pages
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }
}
