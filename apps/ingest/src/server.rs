use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, DefaultBodyLimit, Path, Request, State};
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_MAX_AGE, CACHE_CONTROL, CONTENT_ENCODING, CONTENT_SECURITY_POLICY,
    CONTENT_TYPE, X_CONTENT_TYPE_OPTIONS, X_FRAME_OPTIONS, X_XSS_PROTECTION,
};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::api_envelope::{
    ApiErrorCode, error_response, internal_error, shouting_error, status_body, validation_error,
};
use crate::config::Config;
use crate::fire::{FireIngestor, FireSubmission};
use crate::probe::ProbeTemplate;
use crate::screenshots::ScreenshotStore;
use crate::settings::SettingsService;
use crate::store::{CollectedPage, IngestStore};
use crate::validation::{validate_js_callback, validate_page_callback};

mod body;

use body::{BodyError, DecodedBody, decode_body};

/// Prefix of the operator API namespace; responses under it are forced to JSON.
pub const API_BASE_PATH: &str = "/api/";

const LOCKED_DOWN_CSP: &str = "default-src 'none'; script-src 'none'";
const CORS_ALLOW_HEADERS: &str = "Content-Type, X-Requested-With";
const CORS_MAX_AGE: &str = "86400";

#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    store: Arc<dyn IngestStore>,
    settings: SettingsService,
    screenshots: ScreenshotStore,
    fires: FireIngestor,
    probe: Arc<ProbeTemplate>,
}

impl AppState {
    #[must_use]
    pub fn new(
        config: Config,
        store: Arc<dyn IngestStore>,
        screenshots: ScreenshotStore,
        fires: FireIngestor,
        probe: ProbeTemplate,
    ) -> Self {
        Self {
            config: Arc::new(config),
            settings: SettingsService::new(store.clone()),
            store,
            screenshots,
            fires,
            probe: Arc::new(probe),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let max_body_bytes = state.config.max_body_bytes;
    Router::new()
        .route(
            "/page_callback",
            post(page_callback).options(callback_preflight),
        )
        .route("/js_callback", post(js_callback).options(callback_preflight))
        .route("/screenshots/:filename", get(get_screenshot))
        .route("/health", get(health))
        .route("/", get(probe_script))
        .route("/:probe_id", get(probe_script_for_id))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
        .layer(middleware::from_fn(reject_uppercase_paths))
        .layer(middleware::from_fn(secure_headers))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TraceLayer::new_for_http()),
        )
}

async fn secure_headers(request: Request, next: Next) -> Response {
    let api_path = request.uri().path().starts_with(API_BASE_PATH);
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(X_XSS_PROTECTION, HeaderValue::from_static("mode=block"));
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(X_FRAME_OPTIONS, HeaderValue::from_static("deny"));
    if api_path {
        headers.insert(
            CONTENT_SECURITY_POLICY,
            HeaderValue::from_static(LOCKED_DOWN_CSP),
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }
    response
}

/// Runs ahead of routing: any uppercase byte in the raw path is refused.
async fn reject_uppercase_paths(request: Request, next: Next) -> Response {
    if request
        .uri()
        .path()
        .bytes()
        .any(|byte| byte.is_ascii_uppercase())
    {
        return shouting_error().into_response();
    }
    next.run(request).await
}

fn callback_cors_headers() -> [(HeaderName, &'static str); 4] {
    [
        (ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        (ACCESS_CONTROL_ALLOW_METHODS, "POST, OPTIONS"),
        (ACCESS_CONTROL_ALLOW_HEADERS, CORS_ALLOW_HEADERS),
        (ACCESS_CONTROL_MAX_AGE, CORS_MAX_AGE),
    ]
}

fn probe_script_headers() -> [(HeaderName, &'static str); 7] {
    [
        (CONTENT_SECURITY_POLICY, LOCKED_DOWN_CSP),
        (CONTENT_TYPE, "application/javascript"),
        (CACHE_CONTROL, "no-store"),
        (ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        (ACCESS_CONTROL_ALLOW_METHODS, "GET, OPTIONS"),
        (ACCESS_CONTROL_ALLOW_HEADERS, CORS_ALLOW_HEADERS),
        (ACCESS_CONTROL_MAX_AGE, CORS_MAX_AGE),
    ]
}

async fn callback_preflight() -> Response {
    (StatusCode::NO_CONTENT, callback_cors_headers()).into_response()
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn page_callback(State(state): State<AppState>, request: Request) -> Response {
    let response = match record_collected_page(&state, request).await {
        Ok(()) => (StatusCode::OK, status_body("success")).into_response(),
        Err(response) => response,
    };
    (callback_cors_headers(), response).into_response()
}

async fn record_collected_page(state: &AppState, request: Request) -> Result<(), Response> {
    // Page captures carry no files; any upload is dropped with the body.
    let DecodedBody { fields, .. } = decode_body(request, &state.config.upload_dir)
        .await
        .map_err(body_error_response)?;
    let page = validate_page_callback(&fields)
        .map_err(|error| validation_error(error.field, &error.message).into_response())?;

    state
        .store
        .create_collected_page(CollectedPage {
            id: Uuid::new_v4(),
            uri: page.uri,
            html: Some(page.html),
            created_at: Utc::now(),
        })
        .await
        .map_err(|error| {
            tracing::error!(error = %error, "failed to store collected page");
            internal_error().into_response()
        })
}

async fn js_callback(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    request: Request,
) -> Response {
    let ip_address = client_ip(
        request.headers(),
        peer.map(|ConnectInfo(addr)| addr),
        state.config.trust_forwarded_for,
    );
    let response = match accept_fire(&state, request, ip_address).await {
        Ok(()) => (StatusCode::OK, status_body("success")).into_response(),
        Err(response) => response,
    };
    (callback_cors_headers(), response).into_response()
}

/// Validates synchronously, then hands the fire to a detached task so the
/// probe is answered before any disk or store work happens.
async fn accept_fire(state: &AppState, request: Request, ip_address: String) -> Result<(), Response> {
    let DecodedBody { fields, screenshot } = decode_body(request, &state.config.upload_dir)
        .await
        .map_err(body_error_response)?;
    let callback = validate_js_callback(&fields)
        .map_err(|error| validation_error(error.field, &error.message).into_response())?;

    state.fires.spawn(FireSubmission {
        callback,
        ip_address,
        screenshot,
    });
    Ok(())
}

fn body_error_response(error: BodyError) -> Response {
    match error {
        BodyError::TooLarge => {
            error_response(ApiErrorCode::PayloadTooLarge, "Request body is too large.")
                .into_response()
        }
        BodyError::Upload(error) => {
            tracing::error!(
                target: "probe_ingest.screenshots",
                error = %error,
                "failed to buffer screenshot upload",
            );
            internal_error().into_response()
        }
        other => error_response(ApiErrorCode::InvalidRequest, other.to_string()).into_response(),
    }
}

fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .or_else(|| {
                headers
                    .get("x-real-ip")
                    .and_then(|value| value.to_str().ok())
            })
            .map(str::trim)
            .filter(|value| !value.is_empty());
        if let Some(forwarded) = forwarded {
            return forwarded.to_string();
        }
    }
    peer.map(|addr| addr.ip().to_string()).unwrap_or_default()
}

async fn get_screenshot(State(state): State<AppState>, Path(filename): Path<String>) -> Response {
    match state.screenshots.read_artifact(&filename).await {
        Some(bytes) => (
            StatusCode::OK,
            [
                (CONTENT_TYPE, "image/png"),
                (CONTENT_ENCODING, "gzip"),
                (CACHE_CONTROL, "public, max-age=0"),
            ],
            bytes,
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn health(State(state): State<AppState>) -> Response {
    match state.store.ping().await {
        Ok(()) => (StatusCode::OK, status_body("ok")).into_response(),
        Err(error) => {
            tracing::error!(error = %error, "health check failed");
            (StatusCode::INTERNAL_SERVER_ERROR, status_body("error")).into_response()
        }
    }
}

async fn probe_script(State(state): State<AppState>) -> Response {
    render_probe(&state, None).await
}

async fn probe_script_for_id(
    State(state): State<AppState>,
    Path(probe_id): Path<String>,
) -> Response {
    render_probe(&state, Some(&probe_id)).await
}

async fn render_probe(state: &AppState, probe_id: Option<&str>) -> Response {
    let (pages, chainload_uri) = tokio::join!(
        state.settings.pages_to_collect(),
        state.settings.chainload_uri()
    );
    // A probe with defaults still fires; a store outage must not blank it.
    let pages = pages.unwrap_or_else(|error| {
        tracing::warn!(error = %error, "pages-to-collect unavailable; serving probe without it");
        Vec::new()
    });
    let chainload_uri = chainload_uri.unwrap_or_else(|error| {
        tracing::warn!(error = %error, "chainload uri unavailable; serving probe without it");
        String::new()
    });

    let script = state.probe.render(
        &state.config.host_url(),
        &pages,
        &chainload_uri,
        probe_id,
    );
    (StatusCode::OK, probe_script_headers(), script).into_response()
}

#[cfg(test)]
mod tests;
