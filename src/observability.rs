//! Observability HTTP surface (spec.md §6): health checks, recent-request
//! history, trace/payload lookup and per-key health prediction. Read-only;
//! never touches the datapath's slot/key/circuit state beyond inspecting it.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Serialize;
use serde_json::{json, Value};

use crate::app_state::AppState;
use crate::circuit_breaker::CircuitState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    healthy_keys: usize,
    total_keys: usize,
    uptime: u64,
    backpressure: Value,
}

/// `{status, healthyKeys, totalKeys, uptime, backpressure}`, 503 when no
/// key is currently healthy (spec.md §6).
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.key_manager.get_aggregated_stats();
    let healthy = stats.healthy_keys + stats.half_open_keys;
    let status = if stats.total_keys == 0 || healthy > 0 {
        "OK"
    } else {
        "DEGRADED"
    };
    let body = HealthResponse {
        status,
        healthy_keys: healthy,
        total_keys: stats.total_keys,
        uptime: state.started_at.elapsed().as_secs(),
        backpressure: json!({
            "queue_max_wait_ms": state.config.file().limits.queue_max_wait_ms,
        }),
    };
    let code = if status == "OK" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

#[derive(Serialize)]
struct DeepHealthChecks {
    keys: Value,
    queue: Value,
    memory: Value,
    connections: Value,
    traces: Value,
    model_routing: Value,
}

#[derive(Serialize)]
struct DeepHealthResponse {
    status: &'static str,
    checks: DeepHealthChecks,
    process: Value,
}

/// `200` when every key is closed or half-open, `503` when every key is
/// open (the proxy cannot admit any request).
pub async fn health_deep(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.key_manager.get_aggregated_stats();
    let all_open = stats.total_keys > 0 && stats.open_keys == stats.total_keys;

    let checks = DeepHealthChecks {
        keys: json!({
            "total": stats.total_keys,
            "healthy": stats.healthy_keys,
            "open": stats.open_keys,
            "half_open": stats.half_open_keys,
            "fairness_spread": stats.fairness_spread,
        }),
        queue: json!({
            "max_wait_ms": state.config.file().limits.queue_max_wait_ms,
        }),
        memory: json!({ "status": "ok" }),
        connections: json!({
            "pool_max_idle_per_host": state.config.file().pool_max_idle_per_host,
        }),
        traces: json!({ "len": state.traces.len() }),
        model_routing: json!({
            "enabled": state.config.file().model_routing.enabled,
            "shadow_mode": state.config.file().model_routing.shadow_mode,
        }),
    };

    let status = if all_open { "unhealthy" } else { "healthy" };
    let response = DeepHealthResponse {
        status,
        checks,
        process: json!({
            "pid": std::process::id(),
            "uptime_note": "wall-clock uptime not tracked; see gateway_requests_total for activity",
        }),
    };

    let code = if all_open {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(response))
}

#[derive(serde::Deserialize)]
pub struct HistoryQuery {
    minutes: Option<u32>,
}

pub async fn history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let minutes = query.minutes.unwrap_or(60).min(10_080);
    Json(state.traces.recent_within(minutes))
}

#[derive(serde::Deserialize)]
pub struct ListQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

pub async fn list_requests(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let offset = query.offset.unwrap_or(0).min(10_000);
    Json(state.traces.list(limit, offset))
}

#[derive(serde::Deserialize)]
pub struct SearchQuery {
    key_index: Option<usize>,
    status: Option<String>,
    min_latency: Option<u64>,
}

pub async fn search_requests(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> impl IntoResponse {
    Json(
        state
            .traces
            .search(query.key_index, query.status.as_deref(), query.min_latency),
    )
}

pub async fn get_request(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.traces.get(&id) {
        Some(trace) => (StatusCode::OK, Json(Some(trace))).into_response(),
        None => (StatusCode::NOT_FOUND, Json(None::<Value>)).into_response(),
    }
}

pub async fn get_request_payload(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.payload_cache.get(&id) {
        Some(payload) => (StatusCode::OK, Json(payload)).into_response(),
        None => (StatusCode::NOT_FOUND, Json(Value::Null)).into_response(),
    }
}

#[derive(Serialize)]
struct KeyPrediction {
    key_index: usize,
    key_prefix: String,
    state: &'static str,
    selection_count: u64,
}

/// Per-key health prediction summary (spec.md §6). "Prediction" here is the
/// same health signal the circuit breaker already tracks, surfaced for
/// operators deciding whether to rotate keys before they trip — there is no
/// separate forecasting model.
pub async fn predictions(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.key_manager.get_aggregated_stats();
    let mut entries = Vec::with_capacity(stats.total_keys);
    for i in 0..stats.total_keys {
        if let Some(key) = state.key_manager.key_by_index(i) {
            let state_label = match key.circuit.state() {
                CircuitState::Closed => "healthy",
                CircuitState::Open => "at_risk",
                CircuitState::HalfOpen => "probing",
            };
            entries.push(KeyPrediction {
                key_index: key.key_index,
                key_prefix: key.key_prefix.clone(),
                state: state_label,
                selection_count: key.selection_count(),
            });
        }
    }
    Json(entries)
}
