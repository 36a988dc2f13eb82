//! Library crate for the LLM API reverse proxy (spec.md §1-§2).
//!
//! `main.rs` is a thin binary: it parses CLI args, builds an [`app_state::AppState`]
//! from a config file, wires up the `axum::Router`, and serves it. Every
//! component that matters for correctness lives here so integration tests can
//! exercise the HTTP surface without spawning the binary.

pub mod aimd;
pub mod app_state;
pub mod circuit_breaker;
pub mod config;
pub mod error_classifier;
pub mod forwarder;
pub mod key_manager;
pub mod metrics;
pub mod model_router;
pub mod observability;
pub mod redact;
pub mod sse;
pub mod stream_parser;
pub mod trace;

pub use app_state::AppState;

use axum::routing::{get, post};
use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Builds the full `axum::Router`: the forwarded client surface (spec.md §6)
/// plus the read-only observability surface, sharing one [`AppState`].
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/messages", post(forwarder::handle_messages))
        .route("/v1/chat/completions", post(forwarder::handle_chat_completions))
        .route("/health", get(observability::health))
        .route("/health/deep", get(observability::health_deep))
        .route("/history", get(observability::history))
        .route("/requests", get(observability::list_requests))
        .route("/requests/search", get(observability::search_requests))
        .route("/requests/{id}", get(observability::get_request))
        .route("/requests/{id}/payload", get(observability::get_request_payload))
        .route("/predictions", get(observability::predictions))
        .route("/metrics", get(metrics::metrics_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
