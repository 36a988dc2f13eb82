//! Per-key three-state health gate with half-open probing.
//!
//! States: `Closed` -> `Open` on `N` consecutive fatal failures, `Open` ->
//! `HalfOpen` once the open duration elapses and a probe is admitted,
//! `HalfOpen` -> `Closed` on probe success or back to `Open` on probe
//! failure. At most one probe is in flight in `HalfOpen`.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error_classifier::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl CircuitState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A single per-key circuit breaker. Cheap to clone (wraps `Arc`-free
/// atomics directly so it's typically held behind an `Arc` by the caller,
/// e.g. one per `Key`).
pub struct CircuitBreaker {
    state: AtomicU8,
    failure_count: AtomicU64,
    open_until_ms: AtomicU64,
    /// Guards half-open admission: 0 = no probe in flight, 1 = probe active.
    probe_in_flight: AtomicU8,
    failure_threshold: u64,
    open_duration_ms: u64,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u64, open_duration_ms: u64) -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed as u8),
            failure_count: AtomicU64::new(0),
            open_until_ms: AtomicU64::new(0),
            probe_in_flight: AtomicU8::new(0),
            failure_threshold: failure_threshold.max(1),
            open_duration_ms,
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Can this key be used for a new request right now? `Closed` always
    /// admits. `Open` transitions to `HalfOpen` and admits exactly one
    /// probe once the cooldown has elapsed; all other calls during `Open`
    /// are refused. `HalfOpen` admits only while no probe is in flight.
    pub fn try_admit(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if now_ms() < self.open_until_ms.load(Ordering::Acquire) {
                    return false;
                }
                if self
                    .probe_in_flight
                    .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    return false;
                }
                self.state
                    .store(CircuitState::HalfOpen as u8, Ordering::Release);
                true
            }
            CircuitState::HalfOpen => self
                .probe_in_flight
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
        }
    }

    pub fn on_success(&self) {
        self.failure_count.store(0, Ordering::Release);
        if self.state() == CircuitState::HalfOpen {
            self.state.store(CircuitState::Closed as u8, Ordering::Release);
        }
        self.probe_in_flight.store(0, Ordering::Release);
    }

    /// Only fatal kinds (see `ErrorKind::advances_circuit_breaker`) move
    /// the failure counter. Transient hangups are recorded but excluded
    /// from threshold counting to avoid oscillation.
    pub fn on_failure(&self, kind: ErrorKind) {
        if self.state() == CircuitState::HalfOpen {
            self.open(now_ms());
            self.probe_in_flight.store(0, Ordering::Release);
            return;
        }
        if !kind.advances_circuit_breaker() {
            return;
        }
        let count = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
        if count >= self.failure_threshold {
            self.open(now_ms());
        }
    }

    fn open(&self, now: u64) {
        self.open_until_ms
            .store(now + self.open_duration_ms, Ordering::Release);
        self.state.store(CircuitState::Open as u8, Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
    }

    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::Acquire)
    }
}
