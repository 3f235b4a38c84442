use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS settings (
    id UUID PRIMARY KEY,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE UNIQUE INDEX IF NOT EXISTS settings_key_idx ON settings (key);

CREATE TABLE IF NOT EXISTS injection_requests (
    id UUID PRIMARY KEY,
    request TEXT NOT NULL,
    injection_key TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE UNIQUE INDEX IF NOT EXISTS injection_requests_injection_key_idx
    ON injection_requests (injection_key);

CREATE TABLE IF NOT EXISTS payload_fire_results (
    id UUID PRIMARY KEY,
    url TEXT NOT NULL,
    ip_address TEXT NOT NULL,
    referer TEXT NOT NULL,
    user_agent TEXT NOT NULL,
    cookies TEXT NOT NULL,
    title TEXT NOT NULL,
    dom TEXT NOT NULL,
    text TEXT NOT NULL,
    origin TEXT NOT NULL,
    screenshot_id TEXT,
    was_iframe BOOLEAN NOT NULL,
    browser_timestamp BIGINT NOT NULL,
    correlated_request TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS payload_fire_results_url_idx ON payload_fire_results (url);
CREATE INDEX IF NOT EXISTS payload_fire_results_ip_address_idx ON payload_fire_results (ip_address);
CREATE INDEX IF NOT EXISTS payload_fire_results_referer_idx ON payload_fire_results (referer);
CREATE INDEX IF NOT EXISTS payload_fire_results_user_agent_idx ON payload_fire_results (user_agent);
CREATE INDEX IF NOT EXISTS payload_fire_results_cookies_idx ON payload_fire_results (cookies);
CREATE INDEX IF NOT EXISTS payload_fire_results_title_idx ON payload_fire_results (title);
CREATE INDEX IF NOT EXISTS payload_fire_results_origin_idx ON payload_fire_results (origin);
CREATE INDEX IF NOT EXISTS payload_fire_results_was_iframe_idx ON payload_fire_results (was_iframe);
CREATE INDEX IF NOT EXISTS payload_fire_results_browser_timestamp_idx
    ON payload_fire_results (browser_timestamp);
CREATE INDEX IF NOT EXISTS payload_fire_results_created_at_idx ON payload_fire_results (created_at);

CREATE TABLE IF NOT EXISTS collected_pages (
    id UUID PRIMARY KEY,
    uri TEXT NOT NULL,
    html TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS collected_pages_uri_idx ON collected_pages (uri);
"#;

#[derive(Clone)]
pub struct IngestDb {
    client: Arc<Mutex<Client>>,
}

impl IngestDb {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .context("connect to postgres")?;

        tokio::spawn(async move {
            if let Err(error) = connection.await {
                tracing::error!(reason = %error, "ingest postgres connection error");
            }
        });

        let db = Self {
            client: Arc::new(Mutex::new(client)),
        };
        db.migrate().await?;
        Ok(db)
    }

    /// Applies the schema; every statement is idempotent.
    pub async fn migrate(&self) -> Result<()> {
        let client = self.client.lock().await;
        client
            .batch_execute(SCHEMA)
            .await
            .context("apply ingest schema")?;
        Ok(())
    }

    pub fn client(&self) -> Arc<Mutex<Client>> {
        self.client.clone()
    }
}
