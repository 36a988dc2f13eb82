//! Prometheus metrics surface for the gateway. Mirrors the teacher's
//! `lazy_static!` + `prometheus` registration idiom, narrowed to the
//! counters/gauges the retry engine and AIMD controller actually produce
//! (spec.md §5, §8).

use axum::response::IntoResponse;
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};

use crate::app_state::AppState;

lazy_static! {
    static ref REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "gateway_requests_total",
        "Total number of forwarded requests per model and outcome",
        &["model", "status"]
    )
    .unwrap();

    static ref REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "gateway_request_duration_seconds",
        "End-to-end request duration in seconds per model",
        &["model"],
        vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]
    )
    .unwrap();

    static ref EFFECTIVE_MAX_CONCURRENCY: GaugeVec = register_gauge_vec!(
        "gateway_effective_max_concurrency",
        "Current AIMD-adjusted concurrency ceiling per model",
        &["model"]
    )
    .unwrap();

    static ref IN_FLIGHT: GaugeVec = register_gauge_vec!(
        "gateway_in_flight_requests",
        "Current in-flight request count per model",
        &["model"]
    )
    .unwrap();

    static ref ADJUSTMENTS_TOTAL: CounterVec = register_counter_vec!(
        "gateway_aimd_adjustments_total",
        "Total AIMD window adjustments per model and direction",
        &["model", "direction"]
    )
    .unwrap();

    static ref CIRCUIT_STATE: GaugeVec = register_gauge_vec!(
        "gateway_circuit_state",
        "Per-key circuit breaker state (0=closed, 1=open, 2=half_open)",
        &["key_index"]
    )
    .unwrap();

    static ref KEY_FAIRNESS_SPREAD: prometheus::Gauge = prometheus::register_gauge!(
        "gateway_key_fairness_spread",
        "Spread between the most- and least-selected key's selection count"
    )
    .unwrap();

    static ref RATE_LIMIT_HITS: CounterVec = register_counter_vec!(
        "gateway_rate_limit_hits_total",
        "Number of 429 responses observed per model",
        &["model"]
    )
    .unwrap();
}

pub fn record_request(model: &str, status: &str, duration_secs: f64) {
    REQUESTS_TOTAL.with_label_values(&[model, status]).inc();
    REQUEST_DURATION
        .with_label_values(&[model])
        .observe(duration_secs);
}

pub fn record_rate_limit_hit(model: &str) {
    RATE_LIMIT_HITS.with_label_values(&[model]).inc();
}

pub fn record_aimd_adjustment(model: &str, direction: &str) {
    ADJUSTMENTS_TOTAL
        .with_label_values(&[model, direction])
        .inc();
}

/// Refreshes gauges from live component state just before a scrape, since
/// these are computed values rather than event counters.
fn sync_gauges(state: &AppState) {
    for snapshot in state.aimd.all_snapshots() {
        EFFECTIVE_MAX_CONCURRENCY
            .with_label_values(&[&snapshot.model])
            .set(snapshot.effective_max as f64);
        IN_FLIGHT
            .with_label_values(&[&snapshot.model])
            .set(state.key_manager.in_flight(&snapshot.model) as f64);
    }

    let stats = state.key_manager.get_aggregated_stats();
    KEY_FAIRNESS_SPREAD.set(stats.fairness_spread as f64);
    for i in 0..stats.total_keys {
        if let Some(key) = state.key_manager.key_by_index(i) {
            let value = match key.circuit.state() {
                crate::circuit_breaker::CircuitState::Closed => 0.0,
                crate::circuit_breaker::CircuitState::Open => 1.0,
                crate::circuit_breaker::CircuitState::HalfOpen => 2.0,
            };
            CIRCUIT_STATE
                .with_label_values(&[&i.to_string()])
                .set(value);
        }
    }
}

pub async fn metrics_handler(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> impl IntoResponse {
    sync_gauges(&state);

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "failed to encode metrics".to_string(),
        );
    }
    (
        axum::http::StatusCode::OK,
        String::from_utf8_lossy(&buffer).to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_request_increments_counter() {
        record_request("glm-5", "ok", 0.25);
        assert!(REQUESTS_TOTAL.with_label_values(&["glm-5", "ok"]).get() >= 1.0);
    }

    #[test]
    fn record_aimd_adjustment_increments_counter() {
        record_aimd_adjustment("glm-5", "down");
        assert!(ADJUSTMENTS_TOTAL.with_label_values(&["glm-5", "down"]).get() >= 1.0);
    }
}
