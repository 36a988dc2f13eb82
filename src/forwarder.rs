//! Retry Engine & Forwarder (C7): orchestrates the attempt loop that binds
//! the Model Router, Key Manager, Circuit Breaker and AIMD controller
//! together (spec.md §4.7). Each attempt: route -> acquire a model slot ->
//! select a key -> dispatch upstream -> classify the outcome -> feed back.

use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use rand::Rng;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::aimd::CongestionSignal;
use crate::app_state::AppState;
use crate::config::ConfigFile;
use crate::error_classifier::ErrorKind;
use crate::model_router::{OverflowCause, SelectModelInput};
use crate::trace::{AttemptRecord, RequestTrace};

/// HTTP-facing error taxonomy (spec.md §7). Variant names double as the
/// `X-Proxy-Error` header value and the JSON error `type`.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("context overflow ({cause:?})")]
    ContextOverflow { cause: OverflowCause },
    #[error("unauthorized")]
    Unauthorized,
    #[error("rate limited")]
    RateLimited,
    #[error("upstream unavailable")]
    UpstreamUnavailable,
    #[error("circuit open")]
    CircuitOpen,
    #[error("request timeout")]
    Timeout,
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl ForwardError {
    fn code(&self) -> &'static str {
        match self {
            ForwardError::BadRequest(_) => "bad_request",
            ForwardError::ContextOverflow { .. } => "context_overflow",
            ForwardError::Unauthorized => "unauthorized",
            ForwardError::RateLimited => "rate_limited",
            ForwardError::UpstreamUnavailable => "upstream_unavailable",
            ForwardError::CircuitOpen => "circuit_open",
            ForwardError::Timeout => "timeout",
            ForwardError::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ForwardError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ForwardError::ContextOverflow { .. } => StatusCode::BAD_REQUEST,
            ForwardError::Unauthorized => StatusCode::UNAUTHORIZED,
            ForwardError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ForwardError::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            ForwardError::CircuitOpen => StatusCode::SERVICE_UNAVAILABLE,
            ForwardError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ForwardError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Renders the error as a response carrying `X-Proxy-Error`,
    /// `X-Proxy-Overflow-Cause` (when applicable) and `X-Request-Id`.
    /// `internal` errors log their full chain server-side and never leak
    /// details into the body.
    fn into_response_with_id(self, request_id: &str) -> Response {
        if let ForwardError::Internal(ref err) = self {
            tracing::error!(request_id, chain = ?err.chain().collect::<Vec<_>>(), "internal error");
        }

        let message = match &self {
            ForwardError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        };

        let body = json!({
            "type": "error",
            "error": { "type": self.code(), "message": message }
        });

        let mut response = (self.status(), Json(body)).into_response();
        let headers = response.headers_mut();
        if let Ok(v) = self.code().parse() {
            headers.insert("x-proxy-error", v);
        }
        if let ForwardError::ContextOverflow { cause } = &self {
            let cause_str = match cause {
                OverflowCause::Genuine => "genuine",
                OverflowCause::Transient => "transient",
            };
            if let Ok(v) = cause_str.parse() {
                headers.insert("x-proxy-overflow-cause", v);
            }
        }
        if let Ok(v) = request_id.parse() {
            headers.insert("x-request-id", v);
        }
        response
    }
}

fn generate_request_id() -> String {
    format!("req-{:016x}", rand::thread_rng().gen::<u64>())
}

/// `delay = min(maxBackoffMs, baseMs * 2^attempt) * uniform(1-jitterRatio, 1)`,
/// further capped by `maxJitterMs` of absolute jitter (spec.md §4.7).
fn compute_backoff(attempt: u32, limits: &ConfigFileLimitsView) -> Duration {
    let exp = limits.base_backoff_ms.saturating_mul(1u64 << attempt.min(20));
    let capped = exp.min(limits.max_backoff_ms);
    let jitter_ratio = limits.jitter_ratio.clamp(0.0, 1.0);
    let factor = {
        let mut rng = rand::thread_rng();
        rng.gen_range((1.0 - jitter_ratio)..=1.0)
    };
    let with_jitter = (capped as f64 * factor) as u64;
    let jitter_amount = capped.saturating_sub(with_jitter).min(limits.max_jitter_ms);
    Duration::from_millis(capped.saturating_sub(jitter_amount))
}

/// Borrowed view over the fields of `LimitsConfig` backoff needs, so the
/// retry loop doesn't have to hold a borrow of the whole `ConfigFile`.
struct ConfigFileLimitsView {
    base_backoff_ms: u64,
    max_backoff_ms: u64,
    jitter_ratio: f64,
    max_jitter_ms: u64,
}

impl From<&ConfigFile> for ConfigFileLimitsView {
    fn from(file: &ConfigFile) -> Self {
        Self {
            base_backoff_ms: file.limits.base_backoff_ms,
            max_backoff_ms: file.limits.max_backoff_ms,
            jitter_ratio: file.limits.jitter_ratio,
            max_jitter_ms: file.limits.max_jitter_ms,
        }
    }
}

/// Parses `Retry-After` as either a plain integer (seconds) or an RFC1123/
/// RFC3339 date, per spec.md §6.
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let raw = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    if let Ok(secs) = raw.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    if let Ok(when) = chrono::DateTime::parse_from_rfc2822(raw) {
        let now = chrono::Utc::now();
        let delta = when.with_timezone(&chrono::Utc) - now;
        return delta.to_std().ok();
    }
    if let Ok(when) = chrono::DateTime::parse_from_rfc3339(raw) {
        let now = chrono::Utc::now();
        let delta = when.with_timezone(&chrono::Utc) - now;
        return delta.to_std().ok();
    }
    None
}

/// Attempts to acquire a model slot and select a key, polling with a short
/// sleep until `queue_max_wait_ms` elapses (spec.md §5 backpressure).
async fn acquire_slot_and_key(
    state: &AppState,
    model: &str,
    attempted_keys: &[usize],
    queue_max_wait_ms: u64,
) -> Option<std::sync::Arc<crate::key_manager::KeyEntry>> {
    let deadline = Instant::now() + Duration::from_millis(queue_max_wait_ms);
    loop {
        if state.key_manager.acquire_model_slot(model) {
            if let Some(key) = state.key_manager.select_key(attempted_keys) {
                return Some(key);
            }
            state.key_manager.release_model_slot(model);
        }
        if Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn extract_model(body: &Value) -> Result<String, ForwardError> {
    body.get("model")
        .and_then(Value::as_str)
        .map(|s| s.to_string())
        .ok_or_else(|| ForwardError::BadRequest("missing required field: model".to_string()))
}

fn extract_max_tokens(body: &Value) -> u64 {
    body.get("max_tokens").and_then(Value::as_u64).unwrap_or(0)
}

fn is_streaming(body: &Value) -> bool {
    body.get("stream").and_then(Value::as_bool).unwrap_or(false)
}

/// The highest-ranked complexity signal for `tier: auto` routing rules
/// (spec.md §4.6): a non-empty `tools` array.
fn has_tools(body: &Value) -> bool {
    body.get("tools")
        .and_then(Value::as_array)
        .map(|a| !a.is_empty())
        .unwrap_or(false)
}

/// Injects `stream_options: {include_usage: true}` when the request streams
/// and doesn't already set it, so usage accounting survives the switch to
/// SSE (spec.md §4.7).
fn inject_stream_options(body: &mut Value) {
    if !is_streaming(body) {
        return;
    }
    if let Some(obj) = body.as_object_mut() {
        obj.entry("stream_options")
            .or_insert_with(|| json!({"include_usage": true}));
    }
}

/// Dispatches the request and returns the raw, unconsumed response so the
/// caller can choose to stream or buffer the body.
async fn dispatch(
    state: &AppState,
    path: &str,
    key_secret: &str,
    body: &Value,
) -> Result<reqwest::Response, reqwest::Error> {
    let url = format!("{}{}", state.config.base_url().trim_end_matches('/'), path);
    state
        .config
        .http_client()
        .post(&url)
        .bearer_auth(key_secret)
        .json(body)
        .send()
        .await
}

/// Shared attempt loop used by both the Anthropic-shaped and OpenAI-shaped
/// endpoints (spec.md §6). `path` is the upstream path suffix, e.g.
/// `/v1/messages`.
pub async fn forward(
    state: AppState,
    path: &str,
    headers: HeaderMap,
    mut body: Value,
) -> Response {
    let request_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(generate_request_id);

    let original_model = match extract_model(&body) {
        Ok(m) => m,
        Err(e) => return e.into_response_with_id(&request_id),
    };
    let max_tokens = extract_max_tokens(&body);
    let body_size = serde_json::to_vec(&body).map(|v| v.len() as u64).unwrap_or(0);
    let request_has_tools = has_tools(&body);

    let override_model = headers
        .get("x-model-override")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let admin_token = headers
        .get("x-admin-token")
        .and_then(|v| v.to_str().ok());
    let admin_auth_ok = state.config.admin_auth_ok(admin_token);

    if override_model.is_some() && admin_token.is_some() && !admin_auth_ok {
        return ForwardError::Unauthorized.into_response_with_id(&request_id);
    }

    let limits = ConfigFileLimitsView::from(state.config.file());
    let max_retries = state.config.file().limits.max_retries;
    let queue_max_wait_ms = state.config.file().limits.queue_max_wait_ms;
    let log_decisions = state.config.file().model_routing.log_decisions;

    let mut attempted_models: Vec<String> = Vec::new();
    let mut attempted_keys: Vec<usize> = Vec::new();
    let mut attempts_log: Vec<AttemptRecord> = Vec::new();
    let mut routing_decision_desc: Option<String> = None;
    let started_at = Instant::now();

    for attempt in 0..=max_retries {
        let decision = state.router.select_model(SelectModelInput {
            request_model: &original_model,
            body_size,
            max_tokens,
            attempted_models: &attempted_models,
            override_model: override_model.as_deref(),
            admin_auth_ok,
            include_trace: log_decisions,
            has_tools: request_has_tools,
        });

        let model = match &decision {
            Some(d) if d.genuine_overflow => {
                state.payload_cache.store(&request_id, &body);
                return ForwardError::ContextOverflow {
                    cause: OverflowCause::Genuine,
                }
                .into_response_with_id(&request_id);
            }
            Some(d) if d.reason == "routing_exhausted" => {
                return ForwardError::UpstreamUnavailable.into_response_with_id(&request_id);
            }
            Some(d) => {
                if log_decisions {
                    info!(request_id = %request_id, model = %d.model, tier = %d.tier, reason = %d.reason, upgrade_trigger = ?d.upgrade_trigger, "routing decision");
                }
                routing_decision_desc = Some(format!("{}:{}", d.tier, d.reason));
                d.model.clone()
            }
            None => original_model.clone(),
        };

        if let Some(body_obj) = body.as_object_mut() {
            body_obj.insert("model".to_string(), json!(model));
        }
        inject_stream_options(&mut body);
        let streaming = is_streaming(&body);

        let key = match acquire_slot_and_key(&state, &model, &attempted_keys, queue_max_wait_ms).await {
            Some(k) => k,
            None => {
                crate::metrics::record_request(&model, "circuit_open", started_at.elapsed().as_secs_f64());
                return ForwardError::CircuitOpen.into_response_with_id(&request_id);
            }
        };
        let key_index = key.key_index;
        attempted_keys.push(key_index);

        let attempt_started = Instant::now();
        info!(
            request_id = %request_id,
            model = %model,
            key_index,
            attempt,
            "dispatching upstream attempt"
        );

        let result = dispatch(&state, path, key.secret(), &body).await;
        let latency_ms = attempt_started.elapsed().as_millis() as u64;

        match result {
            Ok(resp) if resp.status().is_success() => {
                key.circuit.on_success();
                state.router.set_in_flight(&model, 0);
                attempts_log.push(AttemptRecord {
                    key_index,
                    model: model.clone(),
                    status: "ok".to_string(),
                    latency_ms,
                });

                if streaming {
                    // Slot stays held across the relay; sse.rs releases it
                    // once the stream actually terminates.
                    let ctx = crate::sse::StreamContext {
                        request_id: request_id.clone(),
                        model: model.clone(),
                        key_index,
                        routing_decision: routing_decision_desc.clone(),
                        attempts: attempts_log,
                        started_at,
                        traces: std::sync::Arc::clone(&state.traces),
                        aimd: std::sync::Arc::clone(&state.aimd),
                        key_manager: std::sync::Arc::clone(&state.key_manager),
                    };
                    return crate::sse::relay_stream(resp, ctx).await;
                }

                state.key_manager.release_model_slot(&model);
                crate::metrics::record_request(&model, "ok", started_at.elapsed().as_secs_f64());
                state.aimd.record_success(&model);
                let body_bytes = resp.bytes().await.unwrap_or_default();
                let usage = crate::stream_parser::extract_usage(&[body_bytes.to_vec()]);
                state.traces.push(RequestTrace {
                    trace_id: request_id.clone(),
                    request_id: request_id.clone(),
                    key_index: Some(key_index),
                    status: "ok".to_string(),
                    latency_ms: started_at.elapsed().as_millis() as u64,
                    routing_decision: routing_decision_desc.clone(),
                    attempts: attempts_log,
                    input_tokens: usage.map(|u| u.input_tokens).unwrap_or(0),
                    output_tokens: usage.map(|u| u.output_tokens).unwrap_or(0),
                    created_at_ms: now_ms(),
                });

                let mut response = Response::builder()
                    .status(StatusCode::OK)
                    .body(Body::from(body_bytes))
                    .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
                if let Ok(v) = request_id.parse() {
                    response.headers_mut().insert("x-request-id", v);
                }
                return response;
            }
            Ok(resp) => {
                let status = resp.status();
                let resp_headers = resp.headers().clone();
                let retry_after = parse_retry_after(&resp_headers);
                let body_bytes = resp.bytes().await.unwrap_or_default();
                let body_text = String::from_utf8_lossy(&body_bytes).to_string();
                attempts_log.push(AttemptRecord {
                    key_index,
                    model: model.clone(),
                    status: status.as_str().to_string(),
                    latency_ms,
                });
                state.key_manager.release_model_slot(&model);

                if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                    let is_quota = body_text.contains("quota");
                    crate::metrics::record_rate_limit_hit(&model);
                    state.aimd.record_congestion(
                        &model,
                        CongestionSignal {
                            retry_after_ms: retry_after.map(|d| d.as_millis() as u64),
                            error_code: is_quota.then(|| "quota_exceeded".to_string()),
                            error_body: Some(body_text.clone()),
                        },
                    );
                    key.circuit.on_failure(ErrorKind::RateLimited);
                    if attempt == max_retries {
                        attempts_log_into_trace(
                            &state, &request_id, key_index, "rate_limited", started_at, routing_decision_desc.clone(), attempts_log,
                        );
                        crate::metrics::record_request(&model, "rate_limited", started_at.elapsed().as_secs_f64());
                        return ForwardError::RateLimited.into_response_with_id(&request_id);
                    }
                    if is_quota {
                        attempted_models.push(model.clone());
                        state.router.record_model_cooldown(&model, state.config.file().adaptive.quota_retry_after_ms);
                    }
                    let backoff = retry_after
                        .map(|d| d.min(Duration::from_millis(limits.max_backoff_ms)))
                        .unwrap_or_else(|| compute_backoff(attempt, &limits));
                    warn!(request_id = %request_id, model = %model, backoff_ms = backoff.as_millis(), "retrying after 429");
                    tokio::time::sleep(backoff).await;
                    continue;
                }

                if status.is_server_error() {
                    key.circuit.on_failure(ErrorKind::ServerError);
                    if attempt == max_retries {
                        attempts_log_into_trace(
                            &state, &request_id, key_index, "upstream_unavailable", started_at, routing_decision_desc.clone(), attempts_log,
                        );
                        crate::metrics::record_request(&model, "upstream_unavailable", started_at.elapsed().as_secs_f64());
                        return ForwardError::UpstreamUnavailable.into_response_with_id(&request_id);
                    }
                    let backoff = compute_backoff(attempt, &limits);
                    tokio::time::sleep(backoff).await;
                    continue;
                }

                // Other 4xx: non-retryable, surface unchanged.
                attempts_log_into_trace(
                    &state, &request_id, key_index, "client_error", started_at, routing_decision_desc.clone(), attempts_log,
                );
                crate::metrics::record_request(&model, "client_error", started_at.elapsed().as_secs_f64());
                let mut response = Response::builder()
                    .status(StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY))
                    .body(Body::from(body_bytes))
                    .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
                if let Ok(v) = request_id.parse() {
                    response.headers_mut().insert("x-request-id", v);
                }
                return response;
            }
            Err(err) => {
                let kind = ErrorKind::classify_reqwest(&err);
                key.circuit.on_failure(kind);
                attempts_log.push(AttemptRecord {
                    key_index,
                    model: model.clone(),
                    status: kind.as_str().to_string(),
                    latency_ms,
                });
                state.key_manager.release_model_slot(&model);
                warn!(request_id = %request_id, model = %model, key_index, kind = %kind, "upstream attempt failed");

                if attempt == max_retries {
                    let final_err = if kind == ErrorKind::Timeout {
                        ForwardError::Timeout
                    } else {
                        ForwardError::UpstreamUnavailable
                    };
                    attempts_log_into_trace(
                        &state, &request_id, key_index, kind.as_str(), started_at, routing_decision_desc.clone(), attempts_log,
                    );
                    crate::metrics::record_request(&model, kind.as_str(), started_at.elapsed().as_secs_f64());
                    return final_err.into_response_with_id(&request_id);
                }
                let backoff = compute_backoff(attempt, &limits);
                tokio::time::sleep(backoff).await;
            }
        }
    }

    ForwardError::UpstreamUnavailable.into_response_with_id(&request_id)
}

fn attempts_log_into_trace(
    state: &AppState,
    request_id: &str,
    key_index: usize,
    status: &str,
    started_at: Instant,
    routing_decision: Option<String>,
    attempts: Vec<AttemptRecord>,
) {
    state.traces.push(RequestTrace {
        trace_id: request_id.to_string(),
        request_id: request_id.to_string(),
        key_index: Some(key_index),
        status: status.to_string(),
        latency_ms: started_at.elapsed().as_millis() as u64,
        routing_decision,
        attempts,
        input_tokens: 0,
        output_tokens: 0,
        created_at_ms: now_ms(),
    });
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub async fn handle_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    forward(state, "/v1/messages", headers, body).await
}

pub async fn handle_chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    forward(state, "/v1/chat/completions", headers, body).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_respects_max_backoff_ms() {
        let limits = ConfigFileLimitsView {
            base_backoff_ms: 200,
            max_backoff_ms: 1000,
            jitter_ratio: 0.0,
            max_jitter_ms: 0,
        };
        for attempt in 0..10 {
            let d = compute_backoff(attempt, &limits);
            assert!(d.as_millis() as u64 <= 1000);
        }
    }

    #[test]
    fn backoff_grows_exponentially_before_cap() {
        let limits = ConfigFileLimitsView {
            base_backoff_ms: 100,
            max_backoff_ms: 100_000,
            jitter_ratio: 0.0,
            max_jitter_ms: 0,
        };
        assert_eq!(compute_backoff(0, &limits).as_millis(), 100);
        assert_eq!(compute_backoff(1, &limits).as_millis(), 200);
        assert_eq!(compute_backoff(2, &limits).as_millis(), 400);
    }

    #[test]
    fn extract_model_requires_field() {
        let err = extract_model(&json!({})).unwrap_err();
        assert_eq!(err.code(), "bad_request");
    }

    #[test]
    fn extract_model_reads_string_field() {
        assert_eq!(extract_model(&json!({"model": "glm-5"})).unwrap(), "glm-5");
    }

    #[test]
    fn parse_retry_after_reads_plain_seconds() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "30".parse().unwrap());
        let d = parse_retry_after(&headers).unwrap();
        assert_eq!(d.as_secs(), 30);
    }

    #[test]
    fn error_response_sets_taxonomy_headers() {
        let resp = ForwardError::CircuitOpen.into_response_with_id("req-abc");
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.headers().get("x-proxy-error").unwrap(), "circuit_open");
        assert_eq!(resp.headers().get("x-request-id").unwrap(), "req-abc");
    }

    #[test]
    fn context_overflow_sets_overflow_cause_header() {
        let resp = ForwardError::ContextOverflow {
            cause: OverflowCause::Genuine,
        }
        .into_response_with_id("req-xyz");
        assert_eq!(
            resp.headers().get("x-proxy-overflow-cause").unwrap(),
            "genuine"
        );
    }
}
