use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::store::PayloadFireResult;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification transport failed: {0}")]
    Transport(String),
    #[error("notification endpoint returned status {0}")]
    Status(u16),
}

/// Fire record as handed to the notification transport.
#[derive(Debug, Clone, Serialize)]
pub struct FireNotification {
    #[serde(flatten)]
    pub record: PayloadFireResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_url: Option<String>,
}

impl FireNotification {
    /// `host_url` is the externally reachable base, e.g. `https://probe.example`.
    pub fn new(record: PayloadFireResult, host_url: &str) -> Self {
        let screenshot_url = record
            .screenshot_id
            .as_deref()
            .map(|id| format!("{host_url}/screenshots/{id}.png"));
        Self {
            record,
            screenshot_url,
        }
    }
}

#[async_trait]
pub trait FireNotifier: Send + Sync {
    async fn notify(&self, notification: &FireNotification) -> Result<(), NotifyError>;
}

/// Posts each notification as JSON to a fixed webhook.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            timeout: Duration::from_millis(timeout_ms.max(250)),
        }
    }
}

#[async_trait]
impl FireNotifier for WebhookNotifier {
    async fn notify(&self, notification: &FireNotification) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(self.url.as_str())
            .timeout(self.timeout)
            .json(notification)
            .send()
            .await
            .map_err(|error| NotifyError::Transport(error.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(NotifyError::Status(status.as_u16()))
        }
    }
}
