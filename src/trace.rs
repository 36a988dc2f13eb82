//! Bounded ring buffer of recent request traces, plus a bounded payload
//! cache for diagnostics (spec.md §3, §6). Observability only — never
//! affects datapath correctness.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use crate::redact::redact_json;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub key_index: usize,
    pub model: String,
    pub status: String,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestTrace {
    pub trace_id: String,
    pub request_id: String,
    pub key_index: Option<usize>,
    pub status: String,
    pub latency_ms: u64,
    pub routing_decision: Option<String>,
    pub attempts: Vec<AttemptRecord>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub created_at_ms: u64,
}

/// Fixed-capacity FIFO: once full, inserting a new trace evicts the
/// oldest. O(1) insertion via `VecDeque`.
pub struct TraceRingBuffer {
    capacity: usize,
    buffer: Mutex<VecDeque<RequestTrace>>,
}

impl TraceRingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            buffer: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    pub fn push(&self, trace: RequestTrace) {
        let mut buf = self.buffer.lock();
        if buf.len() >= self.capacity {
            buf.pop_front();
        }
        buf.push_back(trace);
    }

    pub fn get(&self, request_id: &str) -> Option<RequestTrace> {
        self.buffer
            .lock()
            .iter()
            .find(|t| t.request_id == request_id)
            .cloned()
    }

    pub fn recent_within(&self, minutes: u32) -> Vec<RequestTrace> {
        let cutoff = now_ms().saturating_sub(minutes as u64 * 60_000);
        self.buffer
            .lock()
            .iter()
            .filter(|t| t.created_at_ms >= cutoff)
            .cloned()
            .collect()
    }

    pub fn list(&self, limit: usize, offset: usize) -> Vec<RequestTrace> {
        let buf = self.buffer.lock();
        buf.iter().rev().skip(offset).take(limit).cloned().collect()
    }

    pub fn search(
        &self,
        key_index: Option<usize>,
        status: Option<&str>,
        min_latency: Option<u64>,
    ) -> Vec<RequestTrace> {
        self.buffer
            .lock()
            .iter()
            .filter(|t| key_index.map(|k| t.key_index == Some(k)).unwrap_or(true))
            .filter(|t| status.map(|s| t.status == s).unwrap_or(true))
            .filter(|t| min_latency.map(|m| t.latency_ms >= m).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bounded store of originating request JSON for failed/oversized
/// requests, keyed by request id, with sensitive fields redacted before
/// storage.
pub struct PayloadCache {
    capacity: usize,
    entries: Mutex<VecDeque<(String, Value)>>,
}

impl PayloadCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    pub fn store(&self, request_id: &str, payload: &Value) {
        let redacted = redact_json(payload);
        let mut entries = self.entries.lock();
        if entries.iter().any(|(id, _)| id == request_id) {
            return;
        }
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back((request_id.to_string(), redacted));
    }

    pub fn get(&self, request_id: &str) -> Option<Value> {
        self.entries
            .lock()
            .iter()
            .find(|(id, _)| id == request_id)
            .map(|(_, v)| v.clone())
    }
}
