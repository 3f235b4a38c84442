use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE,
    ACCEPT_RANGES, CACHE_CONTROL, CONTENT_ENCODING, CONTENT_SECURITY_POLICY, CONTENT_TYPE,
    LAST_MODIFIED, X_CONTENT_TYPE_OPTIONS, X_FRAME_OPTIONS, X_XSS_PROTECTION,
};
use axum::http::{Request, StatusCode};
use axum::response::Response;
use flate2::read::GzDecoder;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;

use super::{AppState, build_router};
use crate::config::Config;
use crate::correlation::NO_CORRELATION_SENTINEL;
use crate::fire::FireIngestor;
use crate::probe::ProbeTemplate;
use crate::screenshots::ScreenshotStore;
use crate::settings::{CHAINLOAD_URI_SETTINGS_KEY, PAGES_TO_COLLECT_SETTINGS_KEY};
use crate::store::{
    self, CollectedPage, IngestStore, InjectionRequest, PayloadFireResult, StoreError,
};

const BOUNDARY: &str = "probe-boundary";

struct TestApp {
    router: Router,
    store: Arc<dyn IngestStore>,
    config: Config,
    _dir: TempDir,
}

async fn test_app() -> Result<TestApp> {
    test_app_with(|_| {}, store::memory()).await
}

async fn test_app_with(
    customize: impl FnOnce(&mut Config),
    store: Arc<dyn IngestStore>,
) -> Result<TestApp> {
    let dir = tempfile::tempdir()?;
    let mut config = Config::for_tests(dir.path().to_path_buf());
    customize(&mut config);
    tokio::fs::create_dir_all(&config.upload_dir).await?;

    let screenshots = ScreenshotStore::new(&config.screenshots_dir);
    screenshots.ensure_dir().await?;
    let fires = FireIngestor::new(store.clone(), screenshots.clone(), None, config.host_url());
    let state = AppState::new(
        config.clone(),
        store.clone(),
        screenshots,
        fires,
        ProbeTemplate::bundled(),
    );

    Ok(TestApp {
        router: build_router(state),
        store,
        config,
        _dir: dir,
    })
}

async fn read_json(response: Response) -> Result<Value> {
    let bytes = response.into_body().collect().await?.to_bytes();
    Ok(serde_json::from_slice::<Value>(&bytes)?)
}

async fn read_bytes(response: Response) -> Result<Vec<u8>> {
    Ok(response.into_body().collect().await?.to_bytes().to_vec())
}

fn header<'a>(response: &'a Response, name: axum::http::HeaderName) -> Option<&'a str> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
}

fn multipart_body(fields: &[(&str, &str)], screenshot: Option<&[u8]>) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    if let Some(bytes) = screenshot {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"screenshot\"; \
                 filename=\"screenshot.png\"\r\nContent-Type: image/png\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn multipart_request(uri: &str, body: Vec<u8>) -> Result<Request<Body>> {
    Ok(Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))?)
}

async fn wait_for_fire(store: &Arc<dyn IngestStore>) -> Result<PayloadFireResult> {
    for _ in 0..200 {
        if let Some(record) = store.list_fire_results(1).await?.into_iter().next() {
            return Ok(record);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("fire record was never persisted")
}

async fn wait_for_screenshot(router: &Router, uri: &str) -> Result<Response> {
    for _ in 0..200 {
        let request = Request::builder().uri(uri).body(Body::empty())?;
        let response = router.clone().oneshot(request).await?;
        if response.status() == StatusCode::OK {
            return Ok(response);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("screenshot {uri} never became readable")
}

#[tokio::test]
async fn health_route_reports_ok_with_secure_headers() -> Result<()> {
    let app = test_app().await?;
    let request = Request::builder().uri("/health").body(Body::empty())?;
    let response = app.router.oneshot(request).await?;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, X_XSS_PROTECTION), Some("mode=block"));
    assert_eq!(header(&response, X_CONTENT_TYPE_OPTIONS), Some("nosniff"));
    assert_eq!(header(&response, X_FRAME_OPTIONS), Some("deny"));
    assert!(response.headers().get("x-request-id").is_some());
    assert_eq!(read_json(response).await?, serde_json::json!({"status": "ok"}));
    Ok(())
}

#[tokio::test]
async fn uppercase_path_is_refused_before_routing() -> Result<()> {
    let app = test_app().await?;
    for uri in ["/Health", "/JS_CALLBACK", "/screenshots/ABC.png", "/%2Fprobe"] {
        let request = Request::builder().uri(uri).body(Body::empty())?;
        let response = app.router.clone().oneshot(request).await?;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{uri}");
        assert_eq!(header(&response, X_FRAME_OPTIONS), Some("deny"));
        let body = read_json(response).await?;
        assert_eq!(
            body,
            serde_json::json!({
                "success": false,
                "error": "No.",
                "code": "WHY_ARE_YOU_SHOUTING"
            })
        );
    }
    Ok(())
}

#[tokio::test]
async fn api_namespace_is_forced_to_locked_down_json() -> Result<()> {
    let app = test_app().await?;
    let request = Request::builder()
        .uri("/api/v1/anything")
        .body(Body::empty())?;
    let response = app.router.oneshot(request).await?;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        header(&response, CONTENT_SECURITY_POLICY),
        Some("default-src 'none'; script-src 'none'")
    );
    assert_eq!(header(&response, CONTENT_TYPE), Some("application/json"));
    Ok(())
}

#[tokio::test]
async fn js_callback_with_unknown_key_records_sentinel() -> Result<()> {
    let app = test_app().await?;
    let body = multipart_body(
        &[
            ("injection_key", "abc123"),
            ("uri", "https://victim.test/inbox"),
            ("browser-time", "1700000000000"),
        ],
        None,
    );
    let response = app
        .router
        .clone()
        .oneshot(multipart_request("/js_callback", body)?)
        .await?;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, ACCESS_CONTROL_ALLOW_ORIGIN), Some("*"));
    assert_eq!(
        header(&response, ACCESS_CONTROL_ALLOW_METHODS),
        Some("POST, OPTIONS")
    );
    assert_eq!(read_json(response).await?, serde_json::json!({"status": "success"}));

    let record = wait_for_fire(&app.store).await?;
    assert_eq!(record.screenshot_id, None);
    assert_eq!(record.correlated_request, NO_CORRELATION_SENTINEL);
    assert_eq!(record.url, "https://victim.test/inbox");
    assert_eq!(record.browser_timestamp, 1_700_000_000_000);
    assert_eq!(record.cookies, "");
    assert_eq!(record.ip_address, "");
    assert!(!record.was_iframe);
    Ok(())
}

#[tokio::test]
async fn js_callback_with_known_key_correlates_and_trusts_proxy_when_configured() -> Result<()> {
    let store = store::memory();
    store
        .create_injection_request(InjectionRequest::new("GET /?q=<svg> HTTP/1.1", "key-42"))
        .await?;
    let app = test_app_with(|config| config.trust_forwarded_for = true, store).await?;

    let request = Request::builder()
        .method("POST")
        .uri("/js_callback")
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .header("x-forwarded-for", "203.0.113.5, 10.0.0.1")
        .body(Body::from("injection_key=key-42&was_iframe=true"))?;
    let response = app.router.oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::OK);

    let record = wait_for_fire(&app.store).await?;
    assert_eq!(record.correlated_request, "GET /?q=<svg> HTTP/1.1");
    assert_eq!(record.ip_address, "203.0.113.5");
    assert!(record.was_iframe);
    Ok(())
}

#[tokio::test]
async fn js_callback_validation_failure_has_no_side_effects() -> Result<()> {
    let app = test_app().await?;
    let body = multipart_body(&[("browser-time", "yesterday")], Some(b"png"));
    let response = app
        .router
        .oneshot(multipart_request("/js_callback", body)?)
        .await?;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = read_json(response).await?;
    assert_eq!(body["error"]["code"], "invalid_request");
    assert!(body["errors"]["browser-time"].is_array());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(app.store.list_fire_results(10).await?.is_empty());
    let mut uploads = tokio::fs::read_dir(&app.config.upload_dir).await?;
    assert!(uploads.next_entry().await?.is_none(), "upload must be removed");
    let mut artifacts = tokio::fs::read_dir(&app.config.screenshots_dir).await?;
    assert!(artifacts.next_entry().await?.is_none());
    Ok(())
}

#[tokio::test]
async fn repeated_fields_are_rejected() -> Result<()> {
    let app = test_app().await?;
    let request = Request::builder()
        .method("POST")
        .uri("/js_callback")
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from("title=a&title=b"))?;
    let response = app.router.oneshot(request).await?;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = read_json(response).await?;
    assert!(body["errors"]["title"].is_array());
    Ok(())
}

#[tokio::test]
async fn oversized_body_is_rejected() -> Result<()> {
    let app = test_app_with(|config| config.max_body_bytes = 64, store::memory()).await?;
    let request = Request::builder()
        .method("POST")
        .uri("/js_callback")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(format!(r#"{{"dom":"{}"}}"#, "x".repeat(1024))))?;
    let response = app.router.oneshot(request).await?;

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let body = read_json(response).await?;
    assert_eq!(body["error"]["code"], "payload_too_large");
    Ok(())
}

#[tokio::test]
async fn uploaded_screenshot_round_trips_through_screenshot_route() -> Result<()> {
    let app = test_app().await?;
    let original: Vec<u8> = (0u32..20_000).map(|index| (index % 253) as u8).collect();
    let body = multipart_body(&[("title", "Dashboard")], Some(&original));
    let response = app
        .router
        .clone()
        .oneshot(multipart_request("/js_callback", body)?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let record = wait_for_fire(&app.store).await?;
    let Some(screenshot_id) = record.screenshot_id else {
        bail!("record should reference a screenshot");
    };
    Uuid::parse_str(&screenshot_id)?;

    let response =
        wait_for_screenshot(&app.router, &format!("/screenshots/{screenshot_id}.png")).await?;
    assert_eq!(header(&response, CONTENT_TYPE), Some("image/png"));
    assert_eq!(header(&response, CONTENT_ENCODING), Some("gzip"));
    assert_eq!(header(&response, CACHE_CONTROL), Some("public, max-age=0"));
    assert!(response.headers().get(LAST_MODIFIED).is_none());
    assert!(response.headers().get(ACCEPT_RANGES).is_none());

    let compressed = read_bytes(response).await?;
    let mut decoded = Vec::new();
    GzDecoder::new(compressed.as_slice()).read_to_end(&mut decoded)?;
    assert_eq!(decoded, original);

    let mut uploads = tokio::fs::read_dir(&app.config.upload_dir).await?;
    assert!(uploads.next_entry().await?.is_none(), "upload must be removed");
    Ok(())
}

#[tokio::test]
async fn screenshot_route_hides_malformed_and_missing_names() -> Result<()> {
    let app = test_app().await?;
    let valid_but_missing = "3f2504e0-4f89-41d3-9a0c-0305e82c3301.png";
    // Plant a file that a sloppy matcher would serve.
    tokio::fs::write(
        app.config.screenshots_dir.join("3f2504e0-4f89-31d3-9a0c-0305e82c3301.png.gz"),
        b"decoy",
    )
    .await?;

    for name in [
        valid_but_missing,
        "3f2504e0-4f89-31d3-9a0c-0305e82c3301.png",
        "3f2504e04-f89-41d3-9a0c-0305e82c3301.png",
        "3f2504e0-4f89-41d3-9a0c-0305e82c3301.jpg",
        "..%2f..%2fetc%2fpasswd",
    ] {
        let request = Request::builder()
            .uri(format!("/screenshots/{name}"))
            .body(Body::empty())?;
        let response = app.router.clone().oneshot(request).await?;
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{name}");
        assert!(read_bytes(response).await?.is_empty());
    }
    Ok(())
}

#[tokio::test]
async fn callback_preflight_answers_with_cors() -> Result<()> {
    let app = test_app().await?;
    for uri in ["/js_callback", "/page_callback"] {
        let request = Request::builder()
            .method("OPTIONS")
            .uri(uri)
            .body(Body::empty())?;
        let response = app.router.clone().oneshot(request).await?;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(header(&response, ACCESS_CONTROL_ALLOW_ORIGIN), Some("*"));
        assert_eq!(header(&response, ACCESS_CONTROL_MAX_AGE), Some("86400"));
    }
    Ok(())
}

#[tokio::test]
async fn page_callback_stores_collected_page() -> Result<()> {
    let app = test_app().await?;
    let body = multipart_body(
        &[("uri", "/admin"), ("html", "<h1>Admin</h1>")],
        None,
    );
    let response = app
        .router
        .oneshot(multipart_request("/page_callback", body)?)
        .await?;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, ACCESS_CONTROL_ALLOW_ORIGIN), Some("*"));
    assert_eq!(read_json(response).await?, serde_json::json!({"status": "success"}));

    let pages: Vec<CollectedPage> = app.store.list_collected_pages(10).await?;
    assert_eq!(pages.len(), 1);
    assert_eq!(pages[0].uri, "/admin");
    assert_eq!(pages[0].html.as_deref(), Some("<h1>Admin</h1>"));
    Ok(())
}

#[tokio::test]
async fn probe_script_renders_settings_and_probe_id() -> Result<()> {
    let app = test_app().await?;
    app.store
        .set_setting(PAGES_TO_COLLECT_SETTINGS_KEY, r#"["/admin"]"#)
        .await?;
    app.store
        .set_setting(CHAINLOAD_URI_SETTINGS_KEY, "https://cdn.test/stage2.js")
        .await?;

    let request = Request::builder().uri("/").body(Body::empty())?;
    let response = app.router.clone().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, CONTENT_TYPE), Some("application/javascript"));
    assert_eq!(
        header(&response, CONTENT_SECURITY_POLICY),
        Some("default-src 'none'; script-src 'none'")
    );
    assert_eq!(header(&response, CACHE_CONTROL), Some("no-store"));
    assert_eq!(
        header(&response, ACCESS_CONTROL_ALLOW_METHODS),
        Some("GET, OPTIONS")
    );
    let script = String::from_utf8(read_bytes(response).await?)?;
    assert!(script.contains("\"https://probe.test\""));
    assert!(script.contains(r#"["/admin"]"#));
    assert!(script.contains("\"https://cdn.test/stage2.js\""));
    assert!(script.contains("var probe_id = undefined;"));

    let request = Request::builder().uri("/k-7f3a").body(Body::empty())?;
    let response = app.router.oneshot(request).await?;
    let script = String::from_utf8(read_bytes(response).await?)?;
    assert!(script.contains("var probe_id = \"k-7f3a\";"));
    Ok(())
}

struct UnreachableStore;

fn unreachable_error() -> StoreError {
    StoreError::Db("connection refused".to_string())
}

#[async_trait]
impl IngestStore for UnreachableStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Err(unreachable_error())
    }

    async fn get_setting(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Err(unreachable_error())
    }

    async fn set_setting(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
        Err(unreachable_error())
    }

    async fn create_setting_if_absent(&self, _key: &str, _value: &str) -> Result<bool, StoreError> {
        Err(unreachable_error())
    }

    async fn find_injection_request(
        &self,
        _injection_key: &str,
    ) -> Result<Option<InjectionRequest>, StoreError> {
        Err(unreachable_error())
    }

    async fn create_injection_request(&self, _request: InjectionRequest) -> Result<(), StoreError> {
        Err(unreachable_error())
    }

    async fn create_fire_result(&self, _record: PayloadFireResult) -> Result<(), StoreError> {
        Err(unreachable_error())
    }

    async fn find_fire_result(&self, _id: Uuid) -> Result<Option<PayloadFireResult>, StoreError> {
        Err(unreachable_error())
    }

    async fn list_fire_results(&self, _limit: usize) -> Result<Vec<PayloadFireResult>, StoreError> {
        Err(unreachable_error())
    }

    async fn create_collected_page(&self, _page: CollectedPage) -> Result<(), StoreError> {
        Err(unreachable_error())
    }

    async fn list_collected_pages(&self, _limit: usize) -> Result<Vec<CollectedPage>, StoreError> {
        Err(unreachable_error())
    }
}

#[tokio::test]
async fn store_outage_surfaces_only_where_allowed() -> Result<()> {
    let app = test_app_with(|_| {}, Arc::new(UnreachableStore)).await?;

    let request = Request::builder().uri("/health").body(Body::empty())?;
    let response = app.router.clone().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(read_json(response).await?, serde_json::json!({"status": "error"}));

    // The probe still answers; the failed fire only reaches the log.
    let response = app
        .router
        .clone()
        .oneshot(multipart_request("/js_callback", multipart_body(&[("title", "t")], None))?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let request = Request::builder().uri("/").body(Body::empty())?;
    let response = app.router.clone().oneshot(request).await?;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .router
        .oneshot(multipart_request("/page_callback", multipart_body(&[("title", "t")], None))?)
        .await?;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(read_json(response).await?["error"]["code"], "internal_error");
    Ok(())
}
