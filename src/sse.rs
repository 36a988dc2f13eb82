//! Streaming relay: pipes an upstream SSE/chunked response to the client
//! unchanged while buffering the tail chunks needed to extract token usage
//! once the stream ends (spec.md §4.7). Usage is recorded into the trace
//! asynchronously, after the response has already been handed to Axum.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use crate::aimd::AimdController;
use crate::key_manager::KeyManager;
use crate::stream_parser::extract_usage;
use crate::trace::{AttemptRecord, RequestTrace, TraceRingBuffer};

/// Bounds how many trailing chunks are kept for usage extraction, so a
/// pathologically chatty stream can't grow this unbounded.
const TAIL_BUFFER_CHUNKS: usize = 8;

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub struct StreamContext {
    pub request_id: String,
    pub model: String,
    pub key_index: usize,
    pub routing_decision: Option<String>,
    pub attempts: Vec<AttemptRecord>,
    pub started_at: Instant,
    pub traces: Arc<TraceRingBuffer>,
    pub aimd: Arc<AimdController>,
    pub key_manager: Arc<KeyManager>,
}

/// Relays `resp`'s body to the client, tapping the trailing chunks to
/// recover usage once the stream closes. The returned `Response` is ready
/// to hand back from the handler; everything after the first byte happens
/// in a detached task.
pub async fn relay_stream(resp: reqwest::Response, ctx: StreamContext) -> Response {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(32);

    tokio::spawn(async move {
        let mut stream = resp.bytes_stream();
        let mut tail: Vec<Vec<u8>> = Vec::with_capacity(TAIL_BUFFER_CHUNKS);

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    if tail.len() >= TAIL_BUFFER_CHUNKS {
                        tail.remove(0);
                    }
                    tail.push(bytes.to_vec());
                    if tx.send(Ok(bytes)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx
                        .send(Err(std::io::Error::other(e.to_string())))
                        .await;
                    break;
                }
            }
        }

        // Terminal: the upstream stream has ended (or the client went away),
        // so the slot held for this attempt is released here, not at
        // response-headers time.
        ctx.key_manager.release_model_slot(&ctx.model);
        crate::metrics::record_request(&ctx.model, "ok", ctx.started_at.elapsed().as_secs_f64());

        let usage = extract_usage(&tail);
        ctx.aimd.record_success(&ctx.model);
        ctx.traces.push(RequestTrace {
            trace_id: ctx.request_id.clone(),
            request_id: ctx.request_id,
            key_index: Some(ctx.key_index),
            status: "ok".to_string(),
            latency_ms: ctx.started_at.elapsed().as_millis() as u64,
            routing_decision: ctx.routing_decision,
            attempts: ctx.attempts,
            input_tokens: usage.map(|u| u.input_tokens).unwrap_or(0),
            output_tokens: usage.map(|u| u.output_tokens).unwrap_or(0),
            created_at_ms: now_ms(),
        });
    });

    let body = Body::from_stream(ReceiverStream::new(rx));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_buffer_constant_is_positive() {
        assert!(TAIL_BUFFER_CHUNKS > 0);
    }
}
