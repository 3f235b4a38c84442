use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::correlation::CorrelationResolver;
use crate::notify::{FireNotification, FireNotifier};
use crate::screenshots::{ScreenshotStore, TempUpload};
use crate::store::{IngestStore, PayloadFireResult, StoreError};
use crate::validation::JsCallback;

#[derive(Debug, thiserror::Error)]
pub enum FireError {
    #[error("correlation lookup failed: {0}")]
    Correlation(StoreError),
    #[error("failed to persist fire record: {0}")]
    Persist(StoreError),
}

/// One accepted `/js_callback` submission.
#[derive(Debug)]
pub struct FireSubmission {
    pub callback: JsCallback,
    pub ip_address: String,
    pub screenshot: Option<TempUpload>,
}

pub fn build_fire_record(
    callback: JsCallback,
    ip_address: String,
    screenshot_id: Option<String>,
    correlated_request: String,
) -> PayloadFireResult {
    let browser_timestamp = callback.browser_timestamp();
    let was_iframe = callback.was_iframe();
    PayloadFireResult {
        id: Uuid::new_v4(),
        url: callback.uri,
        ip_address,
        referer: callback.referrer,
        user_agent: callback.user_agent,
        cookies: callback.cookies,
        title: callback.title,
        dom: callback.dom,
        text: callback.text,
        origin: callback.origin,
        screenshot_id,
        was_iframe,
        browser_timestamp,
        correlated_request,
        created_at: Utc::now(),
    }
}

/// Runs everything that happens to a fire after the probe got its response.
#[derive(Clone)]
pub struct FireIngestor {
    store: Arc<dyn IngestStore>,
    resolver: CorrelationResolver,
    screenshots: ScreenshotStore,
    notifier: Option<Arc<dyn FireNotifier>>,
    host_url: String,
}

impl FireIngestor {
    pub fn new(
        store: Arc<dyn IngestStore>,
        screenshots: ScreenshotStore,
        notifier: Option<Arc<dyn FireNotifier>>,
        host_url: impl Into<String>,
    ) -> Self {
        Self {
            resolver: CorrelationResolver::new(store.clone()),
            store,
            screenshots,
            notifier,
            host_url: host_url.into(),
        }
    }

    /// Detached ingestion. Failures end in the log.
    pub fn spawn(&self, submission: FireSubmission) -> JoinHandle<()> {
        let ingestor = self.clone();
        tokio::spawn(async move {
            if let Err(error) = ingestor.ingest(submission).await {
                tracing::error!(target: "probe_ingest.fire", error = %error, "payload fire dropped");
            }
        })
    }

    /// Compresses the screenshot while the record is resolved, built and
    /// created. Returns once both are done. Only record failures are errors;
    /// screenshot and notification failures are logged.
    pub async fn ingest(&self, submission: FireSubmission) -> Result<PayloadFireResult, FireError> {
        let FireSubmission {
            callback,
            ip_address,
            screenshot,
        } = submission;

        let compression = screenshot.map(|upload| {
            let artifact_id = Uuid::new_v4();
            let screenshots = self.screenshots.clone();
            let task =
                tokio::spawn(async move { screenshots.compress(artifact_id, upload).await });
            (artifact_id, task)
        });
        let screenshot_id = compression
            .as_ref()
            .map(|(artifact_id, _)| artifact_id.to_string());

        let recorded = self.record(callback, ip_address, screenshot_id).await;

        if let Some((artifact_id, task)) = compression {
            match task.await {
                Ok(Ok(path)) => tracing::debug!(
                    target: "probe_ingest.screenshots",
                    %artifact_id,
                    path = %path.display(),
                    "screenshot stored",
                ),
                Ok(Err(error)) => tracing::warn!(
                    target: "probe_ingest.screenshots",
                    %artifact_id,
                    error = %error,
                    "screenshot compression failed",
                ),
                Err(error) => tracing::warn!(
                    target: "probe_ingest.screenshots",
                    %artifact_id,
                    error = %error,
                    "screenshot compression task aborted",
                ),
            }
        }

        recorded
    }

    async fn record(
        &self,
        callback: JsCallback,
        ip_address: String,
        screenshot_id: Option<String>,
    ) -> Result<PayloadFireResult, FireError> {
        let correlated_request = self
            .resolver
            .resolve(&callback.injection_key)
            .await
            .map_err(FireError::Correlation)?;

        let probe_uid = callback.probe_uid.clone();
        let record = build_fire_record(callback, ip_address, screenshot_id, correlated_request);
        self.store
            .create_fire_result(record.clone())
            .await
            .map_err(FireError::Persist)?;

        tracing::info!(
            target: "probe_ingest.fire",
            fire_id = %record.id,
            probe_uid = %probe_uid,
            url = %record.url,
            was_iframe = record.was_iframe,
            has_screenshot = record.screenshot_id.is_some(),
            "payload fire recorded",
        );

        if let Some(notifier) = &self.notifier {
            let notification = FireNotification::new(record.clone(), &self.host_url);
            if let Err(error) = notifier.notify(&notification).await {
                tracing::warn!(
                    target: "probe_ingest.fire",
                    fire_id = %record.id,
                    error = %error,
                    "fire notification failed",
                );
            }
        }

        Ok(record)
    }
}
