//! Operator endpoints
//!
//! Read-only views of the scheduler's tables plus a few actions: dropping
//! resource checks, closing in-flight reuse windows and forcing a registry
//! reload.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{json, Value};

use balancer_core::routing::concurrency::ConcurrencySnapshot;
use balancer_core::routing::monitor::MonitorError;
use balancer_core::{
    ModelTypeCheck, ModelTypeOverview, PriorityOverview, PrioritySimulation, ResourceCacheStats,
    ServerType,
};

use crate::error::ApiError;
use crate::state::AppState;

/// Admin sub-router
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/admin/cache/stats", get(cache_stats))
        .route("/admin/cache/clear", post(cache_clear))
        .route("/admin/model-usage/stats", get(model_usage_stats))
        .route("/admin/model-usage/clear", post(model_usage_clear))
        .route("/admin/resource-monitor/config", get(resource_monitor_config))
        .route("/admin/model-type/check/{model}", get(model_type_check))
        .route("/admin/model-type/overview", get(model_type_overview))
        .route("/admin/server-priority/check/{model}", get(priority_check))
        .route("/admin/server-priority/overview", get(priority_overview))
        .route("/admin/registry/refresh", post(registry_refresh))
        .route("/admin/servers/{id}/resources", get(server_resources))
}

async fn cache_stats(State(state): State<AppState>) -> Json<ResourceCacheStats> {
    Json(state.scheduler.resource_cache().stats())
}

/// Clearing the cache also closes reuse windows, so no stale verdict survives
async fn cache_clear(State(state): State<AppState>) -> Json<Value> {
    let reset = state.scheduler.clear_resource_checks();
    Json(json!({
        "cleared": reset.cache_entries,
        "reuse_windows": reset.reuse_windows,
    }))
}

/// Body of `GET /admin/model-usage/stats`
#[derive(Debug, Serialize)]
pub struct ModelUsageReport {
    pub total_in_flight: u64,
    pub grace_period_secs: u64,
    pub pairs: Vec<ConcurrencySnapshot>,
}

async fn model_usage_stats(State(state): State<AppState>) -> Json<ModelUsageReport> {
    let tracker = state.scheduler.concurrency();
    Json(ModelUsageReport {
        total_in_flight: tracker.total_in_flight(),
        grace_period_secs: tracker.grace_period().as_secs(),
        pairs: tracker.snapshot(),
    })
}

async fn model_usage_clear(State(state): State<AppState>) -> Json<Value> {
    let cleared = state.scheduler.concurrency().clear_checks();
    tracing::info!(cleared, "Reuse windows closed by admin request");
    Json(json!({ "cleared": cleared }))
}

async fn resource_monitor_config(State(state): State<AppState>) -> Json<Value> {
    let config = &state.config;
    Json(json!({
        "cpu_port": config.monitor.cpu_port,
        "gpu_port": config.monitor.gpu_port,
        "timeout_ms": u64::try_from(config.monitor.timeout.as_millis()).unwrap_or(u64::MAX),
        "fail_closed": state.scheduler.config().fail_closed,
        "grace_period_secs": state.scheduler.concurrency().grace_period().as_secs(),
        "resource_cache": {
            "base_ttl_secs": config.resource_cache.base_ttl.as_secs(),
            "max_ttl_secs": config.resource_cache.max_ttl.as_secs(),
            "insufficient_ttl_secs": config.resource_cache.insufficient_ttl.as_secs(),
        },
    }))
}

async fn model_type_check(
    State(state): State<AppState>,
    Path(model): Path<String>,
) -> Result<Json<ModelTypeCheck>, ApiError> {
    Ok(Json(state.scheduler.model_type_check(&model).await?))
}

async fn model_type_overview(State(state): State<AppState>) -> Json<ModelTypeOverview> {
    Json(state.scheduler.registry().snapshot().type_overview())
}

async fn priority_check(
    State(state): State<AppState>,
    Path(model): Path<String>,
) -> Result<Json<PrioritySimulation>, ApiError> {
    Ok(Json(state.scheduler.simulate(&model).await?))
}

async fn priority_overview(State(state): State<AppState>) -> Json<Vec<PriorityOverview>> {
    Json(state.scheduler.priority_overview())
}

async fn registry_refresh(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let registry = state.scheduler.registry();
    let stats = registry.refresh_now().await?;
    tracing::info!(
        servers = stats.total,
        active = stats.active,
        "Registry reloaded by admin request"
    );
    Ok(Json(json!({
        "refreshed": true,
        "stats": stats,
        "refreshes": registry.refresh_count(),
    })))
}

fn report(result: Result<Value, MonitorError>) -> Value {
    result.unwrap_or_else(|e| json!({ "error": e.to_string() }))
}

/// Live monitor readings for one registry row
async fn server_resources(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<Value>, ApiError> {
    let server = state
        .scheduler
        .registry()
        .snapshot()
        .server(id)
        .cloned()
        .ok_or(ApiError::UnknownServer(id))?;

    let url = &server.server_url;
    let kind = server.server_type;
    let monitor = &state.monitor;

    let (health, memory) = tokio::join!(monitor.health(url, kind), monitor.memory(url, kind));
    let gpu_memory = match kind {
        ServerType::Gpu => Some(report(monitor.gpu_memory(url, kind).await)),
        ServerType::Cpu => None,
    };

    Ok(Json(json!({
        "server_id": server.id,
        "server_url": server.server_url,
        "type": kind.as_str(),
        "performance": server.performance,
        "monitor_url": monitor.monitor_url(url, kind),
        "health": report(health),
        "memory": report(memory),
        "gpu_memory": gpu_memory,
    })))
}
