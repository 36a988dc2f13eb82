//! Holds keys, per-model concurrency slots, and static-vs-effective limits;
//! selects a key for a request.
//!
//! Slot accounting (`acquire_model_slot`/`release_model_slot`) is tracked
//! per *model*, not per (key, model): the AIMD controller (`aimd.rs`) owns
//! a single effective ceiling per model and the Key Manager enforces it
//! globally, independent of which physical key ultimately serves the
//! request. Key selection is a separate, orthogonal concern driven by
//! circuit-breaker health and fairness. This mirrors the operation
//! signatures in the spec (`acquireModelSlot(model)`, `selectKey(model,
//! attemptedKeys)`) rather than a (key, model) composite — see DESIGN.md.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::circuit_breaker::{CircuitBreaker, CircuitState};

pub struct KeyEntry {
    pub key_index: usize,
    pub key_prefix: String,
    secret: String,
    pub circuit: CircuitBreaker,
    selection_count: AtomicU64,
}

impl KeyEntry {
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Number of times this key has been chosen by `select_key`, used to
    /// surface fairness/usage to operators via `/predictions`.
    pub fn selection_count(&self) -> u64 {
        self.selection_count.load(Ordering::Relaxed)
    }
}

struct ModelSlot {
    static_max: AtomicU32,
    effective_max: AtomicU32,
    in_flight: AtomicU32,
}

impl ModelSlot {
    fn new(static_max: u32) -> Self {
        Self {
            static_max: AtomicU32::new(static_max),
            effective_max: AtomicU32::new(static_max),
            in_flight: AtomicU32::new(0),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AggregatedStats {
    pub total_keys: usize,
    pub healthy_keys: usize,
    pub open_keys: usize,
    pub half_open_keys: usize,
    /// Max selection-count spread across keys; 0 is perfectly fair.
    pub fairness_spread: u64,
}

pub struct KeyManager {
    keys: Vec<Arc<KeyEntry>>,
    model_slots: parking_lot::RwLock<HashMap<String, ModelSlot>>,
    failure_threshold: u64,
    open_duration_ms: u64,
}

impl KeyManager {
    pub fn new(
        secrets: Vec<String>,
        failure_threshold: u64,
        open_duration_ms: u64,
    ) -> Self {
        let keys = secrets
            .into_iter()
            .enumerate()
            .map(|(key_index, secret)| {
                let key_prefix = secret.chars().take(8).collect::<String>();
                Arc::new(KeyEntry {
                    key_index,
                    key_prefix,
                    secret,
                    circuit: CircuitBreaker::new(failure_threshold, open_duration_ms),
                    selection_count: AtomicU64::new(0),
                })
            })
            .collect();
        Self {
            keys,
            model_slots: parking_lot::RwLock::new(HashMap::new()),
            failure_threshold,
            open_duration_ms,
        }
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn key_by_index(&self, index: usize) -> Option<&Arc<KeyEntry>> {
        self.keys.get(index)
    }

    /// Register (or overwrite) the static baseline concurrency for a model.
    /// Also resets `effective_max` to the new static value.
    pub fn register_model(&self, model: &str, static_max: u32) {
        self.model_slots
            .write()
            .insert(model.to_string(), ModelSlot::new(static_max));
    }

    /// `None` signals "unknown model, not tracked" per the spec contract.
    pub fn get_static_model_limit(&self, model: &str) -> Option<u32> {
        self.model_slots
            .read()
            .get(model)
            .map(|w| w.static_max.load(Ordering::Acquire))
    }

    pub fn get_effective_model_limit(&self, model: &str) -> Option<u32> {
        self.model_slots
            .read()
            .get(model)
            .map(|w| w.effective_max.load(Ordering::Acquire))
    }

    /// Written by the AIMD controller in enforce mode. No-op for models
    /// that were never registered.
    pub fn set_effective_model_limit(&self, model: &str, limit: u32) {
        if let Some(w) = self.model_slots.read().get(model) {
            w.effective_max.store(limit, Ordering::Release);
        }
    }

    /// Copies static -> effective for every tracked model.
    pub fn restore_static_limits(&self) {
        let slots = self.model_slots.read();
        for w in slots.values() {
            let s = w.static_max.load(Ordering::Acquire);
            w.effective_max.store(s, Ordering::Release);
        }
    }

    /// Atomic: succeeds iff current in-flight < effective limit. Unknown
    /// models bypass accounting entirely and always succeed.
    pub fn acquire_model_slot(&self, model: &str) -> bool {
        let slots = self.model_slots.read();
        let Some(w) = slots.get(model) else {
            return true;
        };
        let limit = w.effective_max.load(Ordering::Acquire);
        let mut current = w.in_flight.load(Ordering::Acquire);
        loop {
            if current >= limit {
                return false;
            }
            match w.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Atomic decrement with underflow guard. No-op for unknown models.
    pub fn release_model_slot(&self, model: &str) {
        let slots = self.model_slots.read();
        let Some(w) = slots.get(model) else {
            return;
        };
        let mut current = w.in_flight.load(Ordering::Acquire);
        while current > 0 {
            match w.in_flight.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn in_flight(&self, model: &str) -> u32 {
        self.model_slots
            .read()
            .get(model)
            .map(|w| w.in_flight.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Returns a `Closed` or admissible `HalfOpen` key not yet attempted
    /// for this request. Selection is fair: among eligible keys, the one
    /// with the lowest cumulative selection count wins (a simple
    /// deficit-round-robin approximation).
    pub fn select_key(&self, attempted_keys: &[usize]) -> Option<Arc<KeyEntry>> {
        let mut best: Option<&Arc<KeyEntry>> = None;
        for key in &self.keys {
            if attempted_keys.contains(&key.key_index) {
                continue;
            }
            if key.circuit.state() == CircuitState::Open {
                continue;
            }
            let better = match best {
                None => true,
                Some(b) => {
                    key.selection_count.load(Ordering::Relaxed)
                        < b.selection_count.load(Ordering::Relaxed)
                }
            };
            if better {
                best = Some(key);
            }
        }
        let chosen = best?;
        if !chosen.circuit.try_admit() {
            return None;
        }
        chosen.selection_count.fetch_add(1, Ordering::Relaxed);
        Some(Arc::clone(chosen))
    }

    pub fn get_aggregated_stats(&self) -> AggregatedStats {
        let mut healthy = 0;
        let mut open = 0;
        let mut half_open = 0;
        let mut min_count = u64::MAX;
        let mut max_count = 0u64;
        for key in &self.keys {
            match key.circuit.state() {
                CircuitState::Closed => healthy += 1,
                CircuitState::Open => open += 1,
                CircuitState::HalfOpen => half_open += 1,
            }
            let c = key.selection_count.load(Ordering::Relaxed);
            min_count = min_count.min(c);
            max_count = max_count.max(c);
        }
        let fairness_spread = if self.keys.is_empty() {
            0
        } else {
            max_count.saturating_sub(min_count)
        };
        AggregatedStats {
            total_keys: self.keys.len(),
            healthy_keys: healthy,
            open_keys: open,
            half_open_keys: half_open,
            fairness_spread,
        }
    }

    pub fn failure_threshold(&self) -> u64 {
        self.failure_threshold
    }

    pub fn open_duration_ms(&self) -> u64 {
        self.open_duration_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(n: usize) -> KeyManager {
        let secrets = (0..n).map(|i| format!("sk-test-{i:03}")).collect();
        KeyManager::new(secrets, 3, 1000)
    }

    #[test]
    fn unknown_model_bypasses_slot_accounting() {
        let km = manager(1);
        assert_eq!(km.get_static_model_limit("mystery-model"), None);
        assert!(km.acquire_model_slot("mystery-model"));
        assert!(km.acquire_model_slot("mystery-model"));
        km.release_model_slot("mystery-model");
    }

    #[test]
    fn acquire_respects_effective_limit() {
        let km = manager(1);
        km.register_model("glm-5", 2);
        assert!(km.acquire_model_slot("glm-5"));
        assert!(km.acquire_model_slot("glm-5"));
        assert!(!km.acquire_model_slot("glm-5"));
        km.release_model_slot("glm-5");
        assert!(km.acquire_model_slot("glm-5"));
    }

    #[test]
    fn release_never_goes_negative() {
        let km = manager(1);
        km.register_model("glm-5", 2);
        km.release_model_slot("glm-5");
        km.release_model_slot("glm-5");
        assert_eq!(km.in_flight("glm-5"), 0);
    }

    #[test]
    fn restore_static_limits_resets_effective() {
        let km = manager(1);
        km.register_model("glm-5", 10);
        km.set_effective_model_limit("glm-5", 3);
        assert_eq!(km.get_effective_model_limit("glm-5"), Some(3));
        km.restore_static_limits();
        assert_eq!(km.get_effective_model_limit("glm-5"), Some(10));
    }

    #[test]
    fn select_key_skips_attempted_and_open_circuits() {
        let km = manager(3);
        km.key_by_index(0).unwrap().circuit.on_failure(
            crate::error_classifier::ErrorKind::ConnectionRefused,
        );
        for _ in 0..2 {
            km.key_by_index(0).unwrap().circuit.on_failure(
                crate::error_classifier::ErrorKind::ConnectionRefused,
            );
        }
        assert_eq!(
            km.key_by_index(0).unwrap().circuit.state(),
            CircuitState::Open
        );
        let chosen = km.select_key(&[1]).unwrap();
        assert_eq!(chosen.key_index, 2);
    }

    #[test]
    fn select_key_returns_none_when_all_attempted() {
        let km = manager(2);
        assert!(km.select_key(&[0, 1]).is_none());
    }

    #[test]
    fn select_key_is_fair_across_repeated_calls() {
        let km = manager(2);
        let mut counts = [0u32; 2];
        for _ in 0..10 {
            let k = km.select_key(&[]).unwrap();
            counts[k.key_index] += 1;
        }
        assert_eq!(counts[0], 5);
        assert_eq!(counts[1], 5);
    }

    #[test]
    fn aggregated_stats_counts_states() {
        let km = manager(2);
        km.key_by_index(0).unwrap().circuit.on_failure(
            crate::error_classifier::ErrorKind::ConnectionRefused,
        );
        km.key_by_index(0).unwrap().circuit.on_failure(
            crate::error_classifier::ErrorKind::ConnectionRefused,
        );
        km.key_by_index(0).unwrap().circuit.on_failure(
            crate::error_classifier::ErrorKind::ConnectionRefused,
        );
        let stats = km.get_aggregated_stats();
        assert_eq!(stats.total_keys, 2);
        assert_eq!(stats.open_keys, 1);
        assert_eq!(stats.healthy_keys, 1);
    }
}
