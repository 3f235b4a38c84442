use std::sync::Arc;

use async_trait::async_trait;
use tokio_postgres::Row;
use tokio_postgres::error::SqlState;
use uuid::Uuid;

use super::{CollectedPage, IngestStore, InjectionRequest, PayloadFireResult, StoreError};
use crate::db::IngestDb;

const FIRE_RESULT_COLUMNS: &str = "id, url, ip_address, referer, user_agent, cookies, title, \
     dom, text, origin, screenshot_id, was_iframe, browser_timestamp, correlated_request, \
     created_at";

pub(super) struct PostgresIngestStore {
    db: Arc<IngestDb>,
}

impl PostgresIngestStore {
    pub(super) fn new(db: Arc<IngestDb>) -> Self {
        Self { db }
    }
}

fn db_error(error: tokio_postgres::Error) -> StoreError {
    StoreError::Db(error.to_string())
}

fn is_unique_violation(error: &tokio_postgres::Error) -> bool {
    error.code() == Some(&SqlState::UNIQUE_VIOLATION)
}

#[async_trait]
impl IngestStore for PostgresIngestStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        client.simple_query("SELECT 1").await.map_err(db_error)?;
        Ok(())
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt("SELECT value FROM settings WHERE key = $1", &[&key])
            .await
            .map_err(db_error)?;
        row.map(|row| row.try_get::<_, String>("value").map_err(db_error))
            .transpose()
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                r#"
                INSERT INTO settings (id, key, value)
                VALUES ($1, $2, $3)
                ON CONFLICT (key) DO UPDATE
                   SET value = EXCLUDED.value, updated_at = now()
                "#,
                &[&Uuid::new_v4(), &key, &value],
            )
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn create_setting_if_absent(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let inserted = client
            .execute(
                r#"
                INSERT INTO settings (id, key, value)
                VALUES ($1, $2, $3)
                ON CONFLICT (key) DO NOTHING
                "#,
                &[&Uuid::new_v4(), &key, &value],
            )
            .await
            .map_err(db_error)?;
        Ok(inserted == 1)
    }

    async fn find_injection_request(
        &self,
        injection_key: &str,
    ) -> Result<Option<InjectionRequest>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                r#"
                SELECT id, request, injection_key, created_at
                  FROM injection_requests
                 WHERE injection_key = $1
                "#,
                &[&injection_key],
            )
            .await
            .map_err(db_error)?;
        row.as_ref().map(map_injection_request_row).transpose()
    }

    async fn create_injection_request(&self, request: InjectionRequest) -> Result<(), StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                r#"
                INSERT INTO injection_requests (id, request, injection_key, created_at)
                VALUES ($1, $2, $3, $4)
                "#,
                &[
                    &request.id,
                    &request.request,
                    &request.injection_key,
                    &request.created_at,
                ],
            )
            .await
            .map_err(|error| {
                if is_unique_violation(&error) {
                    StoreError::Conflict("injection_key already issued".to_string())
                } else {
                    db_error(error)
                }
            })?;
        Ok(())
    }

    async fn create_fire_result(&self, record: PayloadFireResult) -> Result<(), StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                r#"
                INSERT INTO payload_fire_results (
                    id, url, ip_address, referer, user_agent, cookies, title, dom, text,
                    origin, screenshot_id, was_iframe, browser_timestamp, correlated_request,
                    created_at
                ) VALUES (
                    $1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15
                )
                "#,
                &[
                    &record.id,
                    &record.url,
                    &record.ip_address,
                    &record.referer,
                    &record.user_agent,
                    &record.cookies,
                    &record.title,
                    &record.dom,
                    &record.text,
                    &record.origin,
                    &record.screenshot_id,
                    &record.was_iframe,
                    &record.browser_timestamp,
                    &record.correlated_request,
                    &record.created_at,
                ],
            )
            .await
            .map_err(|error| {
                if is_unique_violation(&error) {
                    StoreError::Conflict("fire result id already exists".to_string())
                } else {
                    db_error(error)
                }
            })?;
        Ok(())
    }

    async fn find_fire_result(&self, id: Uuid) -> Result<Option<PayloadFireResult>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let sql = format!("SELECT {FIRE_RESULT_COLUMNS} FROM payload_fire_results WHERE id = $1");
        let row = client
            .query_opt(sql.as_str(), &[&id])
            .await
            .map_err(db_error)?;
        row.as_ref().map(map_fire_result_row).transpose()
    }

    async fn list_fire_results(&self, limit: usize) -> Result<Vec<PayloadFireResult>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let client = self.db.client();
        let client = client.lock().await;
        let sql = format!(
            "SELECT {FIRE_RESULT_COLUMNS} FROM payload_fire_results \
             ORDER BY created_at DESC LIMIT $1"
        );
        let rows = client
            .query(sql.as_str(), &[&limit])
            .await
            .map_err(db_error)?;
        rows.iter().map(map_fire_result_row).collect()
    }

    async fn create_collected_page(&self, page: CollectedPage) -> Result<(), StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                "INSERT INTO collected_pages (id, uri, html, created_at) VALUES ($1, $2, $3, $4)",
                &[&page.id, &page.uri, &page.html, &page.created_at],
            )
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn list_collected_pages(&self, limit: usize) -> Result<Vec<CollectedPage>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                r#"
                SELECT id, uri, html, created_at
                  FROM collected_pages
                 ORDER BY created_at DESC
                 LIMIT $1
                "#,
                &[&limit],
            )
            .await
            .map_err(db_error)?;
        rows.iter()
            .map(|row| {
                Ok(CollectedPage {
                    id: row.try_get("id").map_err(db_error)?,
                    uri: row.try_get("uri").map_err(db_error)?,
                    html: row.try_get("html").map_err(db_error)?,
                    created_at: row.try_get("created_at").map_err(db_error)?,
                })
            })
            .collect()
    }
}

fn map_injection_request_row(row: &Row) -> Result<InjectionRequest, StoreError> {
    Ok(InjectionRequest {
        id: row.try_get("id").map_err(db_error)?,
        request: row.try_get("request").map_err(db_error)?,
        injection_key: row.try_get("injection_key").map_err(db_error)?,
        created_at: row.try_get("created_at").map_err(db_error)?,
    })
}

fn map_fire_result_row(row: &Row) -> Result<PayloadFireResult, StoreError> {
    Ok(PayloadFireResult {
        id: row.try_get("id").map_err(db_error)?,
        url: row.try_get("url").map_err(db_error)?,
        ip_address: row.try_get("ip_address").map_err(db_error)?,
        referer: row.try_get("referer").map_err(db_error)?,
        user_agent: row.try_get("user_agent").map_err(db_error)?,
        cookies: row.try_get("cookies").map_err(db_error)?,
        title: row.try_get("title").map_err(db_error)?,
        dom: row.try_get("dom").map_err(db_error)?,
        text: row.try_get("text").map_err(db_error)?,
        origin: row.try_get("origin").map_err(db_error)?,
        screenshot_id: row.try_get("screenshot_id").map_err(db_error)?,
        was_iframe: row.try_get("was_iframe").map_err(db_error)?,
        browser_timestamp: row.try_get("browser_timestamp").map_err(db_error)?,
        correlated_request: row.try_get("correlated_request").map_err(db_error)?,
        created_at: row.try_get("created_at").map_err(db_error)?,
    })
}
