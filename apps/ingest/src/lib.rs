#![forbid(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::panic))]

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;

use crate::{
    config::Config,
    db::IngestDb,
    fire::FireIngestor,
    notify::{FireNotifier, WebhookNotifier},
    probe::ProbeTemplate,
    screenshots::ScreenshotStore,
    server::{AppState, build_router},
    settings::SettingsService,
    store::IngestStore,
};

pub mod api_envelope;
pub mod config;
pub mod correlation;
pub mod db;
pub mod fire;
pub mod notify;
pub mod probe;
pub mod screenshots;
pub mod server;
pub mod settings;
pub mod store;
pub mod validation;

pub async fn build_store(config: &Config) -> Result<Arc<dyn IngestStore>> {
    match config.database_url.as_deref() {
        Some(url) => Ok(store::postgres(Arc::new(IngestDb::connect(url).await?))),
        None => {
            tracing::warn!(
                target: "probe_ingest.store",
                "no DATABASE_URL configured; evidence is kept in memory and lost on exit"
            );
            Ok(store::memory())
        }
    }
}

fn build_notifier(config: &Config) -> Option<Arc<dyn FireNotifier>> {
    if !config.notifications_enabled {
        return None;
    }
    let url = config.notification_webhook_url.clone()?;
    Some(Arc::new(WebhookNotifier::new(
        url,
        config.notification_timeout_ms,
    )))
}

/// Connects the store, prepares directories, bootstraps secrets and loads the
/// probe template.
pub async fn build_ingest_state(config: Config) -> Result<AppState> {
    let store = build_store(&config).await?;

    let screenshots = ScreenshotStore::new(&config.screenshots_dir);
    screenshots.ensure_dir().await.with_context(|| {
        format!(
            "failed to create screenshots dir {}",
            config.screenshots_dir.display()
        )
    })?;
    tokio::fs::create_dir_all(&config.upload_dir)
        .await
        .with_context(|| {
            format!(
                "failed to create upload dir {}",
                config.upload_dir.display()
            )
        })?;

    let report = SettingsService::new(store.clone())
        .bootstrap(config.bcrypt_rounds)
        .await?;
    info!(
        target: "probe_ingest.bootstrap",
        session_secret_created = report.session_secret_created,
        admin_user_created = report.admin_user_created,
        correlation_api_secret_created = report.correlation_api_secret_created,
        "settings bootstrap complete"
    );

    let probe = ProbeTemplate::load(config.probe_template_path.as_deref())
        .await
        .context("failed to load probe template")?;
    let fires = FireIngestor::new(
        store.clone(),
        screenshots.clone(),
        build_notifier(&config),
        config.host_url(),
    );

    Ok(AppState::new(config, store, screenshots, fires, probe))
}

pub async fn build_app(config: Config) -> Result<axum::Router> {
    Ok(build_router(build_ingest_state(config).await?))
}

pub async fn serve(config: Config) -> Result<()> {
    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(
        bind_addr = %config.bind_addr,
        hostname = %config.hostname,
        "probe ingest service listening"
    );
    let app = build_app(config).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
