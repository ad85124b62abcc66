//! Router, client-facing proxy handlers and observability endpoints

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderValue, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Serialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use balancer_core::proxy::PASSTHROUGH_ENDPOINTS;
use balancer_core::registry::RegistryStats;
use balancer_core::routing::concurrency::ConcurrencySnapshot;
use balancer_core::routing::health::HealthSnapshot;
use balancer_core::routing::metrics::MetricsSummary;
use balancer_core::ProxyRequest;

use crate::admin;
use crate::error::ApiError;
use crate::state::AppState;

/// Response header carrying the request identifier
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Response header naming the backend row that answered
pub const SERVER_ID_HEADER: &str = "x-balancer-server-id";

/// Build the full router over `state`
pub fn build_router(state: AppState) -> Router {
    let body_limit = state.config.max_request_bytes;

    let mut router = Router::new();
    for endpoint in PASSTHROUGH_ENDPOINTS {
        router = router.route(endpoint, post(proxy));
    }

    router
        .route("/api/tags", get(ollama_tags))
        .route("/v1/models", get(openai_models))
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .merge(admin::routes())
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Client Endpoints
// ============================================================================

/// Route one inference request and stream the chosen backend's answer
async fn proxy(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request = ProxyRequest::from_json(uri.path(), &headers, &body)?;
    let request_id = request.request_id;
    let response = state.scheduler.dispatch(request).await?;

    let mut out = Response::new(Body::from_stream(response.body));
    *out.status_mut() = response.status;
    *out.headers_mut() = response.headers;
    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        out.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    out.headers_mut()
        .insert(SERVER_ID_HEADER, HeaderValue::from(response.server.id));
    Ok(out)
}

/// Ollama-style listing of virtual models
async fn ollama_tags(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.scheduler.registry().snapshot();
    let modified_at = snapshot.loaded_at().to_rfc3339();
    let models: Vec<Value> = snapshot
        .virtual_models()
        .into_iter()
        .map(|name| {
            json!({
                "name": name,
                "model": name,
                "modified_at": modified_at,
            })
        })
        .collect();
    Json(json!({ "models": models }))
}

/// OpenAI-style listing of virtual models
async fn openai_models(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.scheduler.registry().snapshot();
    let created = snapshot.loaded_at().timestamp();
    let data: Vec<Value> = snapshot
        .virtual_models()
        .into_iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "created": created,
                "owned_by": "ollama-balancer",
            })
        })
        .collect();
    Json(json!({ "object": "list", "data": data }))
}

// ============================================================================
// Observability
// ============================================================================

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Body of `GET /status`
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub config_source: String,
    pub registry: RegistryReport,
    pub health: Vec<HealthSnapshot>,
    pub in_flight: Vec<ConcurrencySnapshot>,
    pub requests: MetricsSummary,
}

/// Registry part of [`StatusReport`]
#[derive(Debug, Serialize)]
pub struct RegistryReport {
    pub stats: RegistryStats,
    pub refreshes: u64,
    pub refresh_failures: u64,
}

async fn status(State(state): State<AppState>) -> Json<StatusReport> {
    let scheduler = &state.scheduler;
    let registry = scheduler.registry();
    Json(StatusReport {
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: scheduler.metrics().uptime().as_secs(),
        config_source: state.config.source().to_string(),
        registry: RegistryReport {
            stats: registry.stats(),
            refreshes: registry.refresh_count(),
            refresh_failures: registry.refresh_failures(),
        },
        health: scheduler.health().snapshot_all(),
        in_flight: scheduler.concurrency().snapshot(),
        requests: scheduler.metrics().summary(),
    })
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let scheduler = &state.scheduler;
    let text = scheduler
        .metrics()
        .to_prometheus(&scheduler.resource_cache().stats());
    (
        [(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )],
        text,
    )
}
