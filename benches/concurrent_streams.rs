//! Hot-path benchmarks for the two components every forwarded request
//! touches at least once: the circuit breaker's admission check and the
//! AIMD controller's congestion feedback / tick.

use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};

use llm_gateway::aimd::{AdaptiveConfig, AdaptiveMode, AimdController, CongestionSignal, GrowthMode};
use llm_gateway::circuit_breaker::CircuitBreaker;
use llm_gateway::error_classifier::ErrorKind;
use llm_gateway::key_manager::KeyManager;

fn bench_circuit_breaker_admit_closed(c: &mut Criterion) {
    let breaker = CircuitBreaker::new(5, 30_000);
    c.bench_function("circuit_breaker_try_admit_closed", |b| {
        b.iter(|| black_box(breaker.try_admit()));
    });
}

fn bench_circuit_breaker_success_failure_cycle(c: &mut Criterion) {
    let breaker = CircuitBreaker::new(1_000_000, 30_000);
    c.bench_function("circuit_breaker_success_then_failure", |b| {
        b.iter(|| {
            breaker.on_success();
            breaker.on_failure(black_box(ErrorKind::SocketHangup));
        });
    });
}

fn test_config() -> AdaptiveConfig {
    AdaptiveConfig {
        mode: AdaptiveMode::Enforce,
        tick_interval_ms: 2_000,
        decrease_factor: 0.5,
        recovery_delay_ms: 5_000,
        min_window: 1,
        growth_mode: GrowthMode::FixedTicks,
        growth_clean_ticks: 2,
        min_hold_ms: 4_000,
        idle_timeout_ms: 60_000,
        idle_decay_step: 1,
        quota_retry_after_ms: 60_000,
        treat_unknown_as_congestion: true,
        global_max_concurrency: 0,
    }
}

fn bench_aimd_record_congestion(c: &mut Criterion) {
    let key_manager = Arc::new(KeyManager::new(
        vec!["sk-bench".to_string()],
        5,
        30_000,
    ));
    let aimd = AimdController::new(test_config(), key_manager);
    aimd.register_model("glm-5", 20);

    c.bench_function("aimd_record_congestion", |b| {
        b.iter(|| {
            aimd.record_congestion(
                "glm-5",
                black_box(CongestionSignal {
                    retry_after_ms: None,
                    error_code: Some("rate_limit_error".to_string()),
                    error_body: None,
                }),
            );
        });
    });
}

fn bench_aimd_tick_many_models(c: &mut Criterion) {
    let key_manager = Arc::new(KeyManager::new(
        vec!["sk-bench".to_string()],
        5,
        30_000,
    ));
    let aimd = AimdController::new(test_config(), key_manager);
    for i in 0..64 {
        aimd.register_model(&format!("model-{i}"), 20);
    }

    c.bench_function("aimd_tick_64_models", |b| {
        b.iter(|| aimd.tick());
    });
}

criterion_group!(
    circuit_breaker_benches,
    bench_circuit_breaker_admit_closed,
    bench_circuit_breaker_success_failure_cycle,
);

criterion_group!(
    aimd_benches,
    bench_aimd_record_congestion,
    bench_aimd_tick_many_models,
);

criterion_main!(circuit_breaker_benches, aimd_benches);
