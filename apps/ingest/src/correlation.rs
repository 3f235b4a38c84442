use std::sync::Arc;

use crate::store::{IngestStore, StoreError};

/// Stored in place of the request text when a fire carries an unknown key.
pub const NO_CORRELATION_SENTINEL: &str = "No correlated request found for this injection.";

/// Maps a fire's `injection_key` to the request text of the injection that
/// produced it.
#[derive(Clone)]
pub struct CorrelationResolver {
    store: Arc<dyn IngestStore>,
}

impl CorrelationResolver {
    pub fn new(store: Arc<dyn IngestStore>) -> Self {
        Self { store }
    }

    /// One exact-match lookup. A miss is not an error.
    pub async fn resolve(&self, injection_key: &str) -> Result<String, StoreError> {
        let found = self.store.find_injection_request(injection_key).await?;
        Ok(found.map_or_else(
            || NO_CORRELATION_SENTINEL.to_string(),
            |request| request.request,
        ))
    }
}
