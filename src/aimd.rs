//! AIMD tick loop adjusting effective per-model concurrency limits from
//! 429 feedback (spec.md §4.5).
//!
//! One `ModelWindow` exists per known model, created lazily on first
//! traffic. A periodic tick (`tick_interval_ms`, default 2s) runs a single
//! pass over every window, then applies global-window enforcement across
//! all windows together. Two modes: `observe_only` computes the same
//! decisions but never writes back to the Key Manager; `enforce` does.
//! Mode is fixed at construction; an invalid mode string coerces to
//! `observe_only` (see `AdaptiveMode::parse`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::key_manager::KeyManager;
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdaptiveMode {
    ObserveOnly,
    Enforce,
}

impl AdaptiveMode {
    /// Invalid values coerce to `observe_only` rather than failing config
    /// load, per spec.md §9.
    pub fn parse(s: &str) -> Self {
        match s {
            "enforce" => AdaptiveMode::Enforce,
            "observe_only" => AdaptiveMode::ObserveOnly,
            _ => AdaptiveMode::ObserveOnly,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrowthMode {
    FixedTicks,
    Proportional,
}

impl GrowthMode {
    pub fn parse(s: &str) -> Self {
        match s {
            "proportional" => GrowthMode::Proportional,
            _ => GrowthMode::FixedTicks,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CongestionSignal {
    pub retry_after_ms: Option<u64>,
    pub error_code: Option<String>,
    pub error_body: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AdaptiveConfig {
    pub mode: AdaptiveMode,
    pub tick_interval_ms: u64,
    pub decrease_factor: f64,
    pub recovery_delay_ms: u64,
    pub min_window: u32,
    pub growth_mode: GrowthMode,
    pub growth_clean_ticks: u32,
    pub min_hold_ms: u64,
    pub idle_timeout_ms: u64,
    pub idle_decay_step: u32,
    pub quota_retry_after_ms: u64,
    pub treat_unknown_as_congestion: bool,
    /// 0 disables global enforcement.
    pub global_max_concurrency: u32,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            mode: AdaptiveMode::ObserveOnly,
            tick_interval_ms: 2000,
            decrease_factor: 0.5,
            recovery_delay_ms: 5000,
            min_window: 1,
            growth_mode: GrowthMode::FixedTicks,
            growth_clean_ticks: 2,
            min_hold_ms: 4000,
            idle_timeout_ms: 60_000,
            idle_decay_step: 1,
            quota_retry_after_ms: 60_000,
            treat_unknown_as_congestion: true,
            global_max_concurrency: 0,
        }
    }
}

struct ModelWindow {
    static_max: u32,
    effective_max: u32,
    congestion_count: u32,
    success_count: u32,
    quota_hit_count: u32,
    unknown_hit_count: u32,
    consecutive_clean_ticks: u32,
    last_adjust_at: Option<u64>,
    last_congestion_at: u64,
    last_traffic_at: u64,
    adjustments_down: u64,
    adjustments_up: u64,
    last_adjust_reason: &'static str,
}

impl ModelWindow {
    fn new(static_max: u32, now: u64) -> Self {
        Self {
            static_max,
            effective_max: static_max,
            congestion_count: 0,
            success_count: 0,
            quota_hit_count: 0,
            unknown_hit_count: 0,
            consecutive_clean_ticks: 0,
            last_adjust_at: None,
            last_congestion_at: 0,
            last_traffic_at: now,
            adjustments_down: 0,
            adjustments_up: 0,
            last_adjust_reason: "none",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WindowSnapshot {
    pub model: String,
    pub static_max: u32,
    pub effective_max: u32,
    pub adjustments_down: u64,
    pub adjustments_up: u64,
    pub consecutive_clean_ticks: u32,
    pub last_adjust_reason: &'static str,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub struct AimdController {
    windows: RwLock<HashMap<String, Mutex<ModelWindow>>>,
    config: AdaptiveConfig,
    key_manager: Arc<KeyManager>,
    running: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AimdController {
    pub fn new(config: AdaptiveConfig, key_manager: Arc<KeyManager>) -> Arc<Self> {
        Arc::new(Self {
            windows: RwLock::new(HashMap::new()),
            config,
            key_manager,
            running: AtomicBool::new(false),
            task: Mutex::new(None),
        })
    }

    pub fn mode(&self) -> AdaptiveMode {
        self.config.mode
    }

    /// Registers a known model with its configured static baseline. Must
    /// be called before traffic for the model arrives, so the window is
    /// not accidentally treated as unknown.
    pub fn register_model(&self, model: &str, static_max: u32) {
        self.windows
            .write()
            .entry(model.to_string())
            .or_insert_with(|| Mutex::new(ModelWindow::new(static_max, now_ms())));
    }

    fn is_known(&self, model: &str) -> bool {
        self.windows.read().contains_key(model)
    }

    pub fn record_congestion(&self, model: &str, signal: CongestionSignal) {
        self.record_congestion_at(model, signal, now_ms());
    }

    fn record_congestion_at(&self, model: &str, signal: CongestionSignal, now: u64) {
        if !self.is_known(model) {
            return;
        }
        let windows = self.windows.read();
        let mut w = windows.get(model).unwrap().lock();
        w.congestion_count += 1;
        let is_quota = signal
            .retry_after_ms
            .map(|ms| ms > self.config.quota_retry_after_ms)
            .unwrap_or(false)
            || signal.error_code.as_deref() == Some("quota_exceeded")
            || signal
                .error_body
                .as_deref()
                .map(|b| b.contains("quota"))
                .unwrap_or(false);
        if is_quota {
            w.quota_hit_count += 1;
        }
        if signal.retry_after_ms.is_none() && signal.error_code.is_none() {
            w.unknown_hit_count += 1;
        }
        w.last_congestion_at = now;
        w.last_traffic_at = now;
    }

    pub fn record_success(&self, model: &str) {
        self.record_success_at(model, now_ms());
    }

    fn record_success_at(&self, model: &str, now: u64) {
        if !self.is_known(model) {
            return;
        }
        let windows = self.windows.read();
        let mut w = windows.get(model).unwrap().lock();
        w.success_count += 1;
        w.last_traffic_at = now;
    }

    pub fn effective_max(&self, model: &str) -> Option<u32> {
        self.windows
            .read()
            .get(model)
            .map(|w| w.lock().effective_max)
    }

    pub fn snapshot(&self, model: &str) -> Option<WindowSnapshot> {
        self.windows.read().get(model).map(|w| {
            let w = w.lock();
            WindowSnapshot {
                model: model.to_string(),
                static_max: w.static_max,
                effective_max: w.effective_max,
                adjustments_down: w.adjustments_down,
                adjustments_up: w.adjustments_up,
                consecutive_clean_ticks: w.consecutive_clean_ticks,
                last_adjust_reason: w.last_adjust_reason,
            }
        })
    }

    pub fn all_snapshots(&self) -> Vec<WindowSnapshot> {
        let windows = self.windows.read();
        windows
            .iter()
            .map(|(model, w)| {
                let w = w.lock();
                WindowSnapshot {
                    model: model.clone(),
                    static_max: w.static_max,
                    effective_max: w.effective_max,
                    adjustments_down: w.adjustments_down,
                    adjustments_up: w.adjustments_up,
                    consecutive_clean_ticks: w.consecutive_clean_ticks,
                    last_adjust_reason: w.last_adjust_reason,
                }
            })
            .collect()
    }

    /// Runs a single tick pass over every window, then global enforcement.
    pub fn tick(&self) {
        self.tick_at(now_ms());
    }

    fn tick_at(&self, now: u64) {
        let windows = self.windows.read();
        for (model, cell) in windows.iter() {
            self.tick_window(model, cell, now);
        }
        drop(windows);
        self.enforce_global(now);
    }

    fn tick_window(&self, model: &str, cell: &Mutex<ModelWindow>, now: u64) {
        let mut w = cell.lock();

        // 1. Anti-flap gate: accumulators are retained, not reset.
        if let Some(last) = w.last_adjust_at {
            if now.saturating_sub(last) < self.config.min_hold_ms {
                return;
            }
        }

        if w.congestion_count > 0 {
            // 2. Congestion branch.
            let classify = if w.quota_hit_count > 0 {
                "quota"
            } else if w.unknown_hit_count == w.congestion_count {
                "unknown"
            } else {
                "congestion"
            };

            match classify {
                "quota" => {
                    w.last_adjust_reason = "quota_skip";
                }
                "unknown" if !self.config.treat_unknown_as_congestion => {
                    w.last_adjust_reason = "unknown_skip";
                }
                _ => {
                    let floor = self.config.min_window;
                    let new_max = ((w.effective_max as f64 * self.config.decrease_factor).floor()
                        as u32)
                        .max(floor);
                    if new_max != w.effective_max {
                        w.effective_max = new_max;
                        w.adjustments_down += 1;
                        w.last_adjust_at = Some(now);
                        w.consecutive_clean_ticks = 0;
                        w.last_adjust_reason = "congestion_decrease";
                        if self.config.mode == AdaptiveMode::Enforce {
                            self.key_manager.set_effective_model_limit(model, new_max);
                        }
                        metrics::record_aimd_adjustment(model, "down");
                        debug!(model, new_max, "aimd multiplicative decrease");
                    }
                }
            }
            w.congestion_count = 0;
            w.success_count = 0;
            w.quota_hit_count = 0;
            w.unknown_hit_count = 0;
            return;
        }

        if w.success_count > 0 && now.saturating_sub(w.last_congestion_at) > self.config.recovery_delay_ms
        {
            // 3. Growth branch.
            w.consecutive_clean_ticks += 1;
            let (should_grow, step) = match self.config.growth_mode {
                GrowthMode::FixedTicks => (
                    w.consecutive_clean_ticks >= self.config.growth_clean_ticks,
                    1u32,
                ),
                GrowthMode::Proportional => {
                    let step = ((w.static_max as f64 * 0.1).ceil() as u32).max(1);
                    (true, step)
                }
            };
            if should_grow {
                let new_max = (w.effective_max + step).min(w.static_max);
                if new_max != w.effective_max {
                    w.effective_max = new_max;
                    w.adjustments_up += 1;
                    w.last_adjust_at = Some(now);
                    w.consecutive_clean_ticks = 0;
                    w.last_adjust_reason = "additive_increase";
                    if self.config.mode == AdaptiveMode::Enforce {
                        self.key_manager.set_effective_model_limit(model, new_max);
                    }
                    metrics::record_aimd_adjustment(model, "up");
                    debug!(model, new_max, "aimd additive increase");
                }
            }
            w.congestion_count = 0;
            w.success_count = 0;
            w.quota_hit_count = 0;
            w.unknown_hit_count = 0;
            return;
        }

        if w.success_count == 0 && w.congestion_count == 0 {
            // 4. Idle branch.
            if now.saturating_sub(w.last_traffic_at) > self.config.idle_timeout_ms
                && w.effective_max < w.static_max
            {
                let new_max = (w.effective_max + self.config.idle_decay_step).min(w.static_max);
                if new_max != w.effective_max {
                    w.effective_max = new_max;
                    w.last_adjust_at = Some(now);
                    w.last_adjust_reason = "idle_drift_up";
                    if self.config.mode == AdaptiveMode::Enforce {
                        self.key_manager.set_effective_model_limit(model, new_max);
                    }
                }
            }
        }

        // 5. Reset accumulators (idempotent for branches that already did).
        w.congestion_count = 0;
        w.success_count = 0;
        w.quota_hit_count = 0;
        w.unknown_hit_count = 0;
    }

    fn enforce_global(&self, now: u64) {
        let limit = self.config.global_max_concurrency;
        if limit == 0 {
            return;
        }
        let windows = self.windows.read();
        let sum: u64 = windows.values().map(|w| w.lock().effective_max as u64).sum();
        if sum <= limit as u64 {
            return;
        }
        let ratio = limit as f64 / sum as f64;
        for (model, cell) in windows.iter() {
            let mut w = cell.lock();
            let floor = self.config.min_window;
            let scaled = ((w.effective_max as f64 * ratio).floor() as u32).max(floor);
            if scaled != w.effective_max {
                w.effective_max = scaled;
                w.last_adjust_at = Some(now);
                w.last_adjust_reason = "global_scaled";
                if self.config.mode == AdaptiveMode::Enforce {
                    self.key_manager.set_effective_model_limit(model, scaled);
                }
            }
        }
    }

    /// Idempotent: a second `start()` while already running is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let controller = Arc::clone(self);
        let interval = Duration::from_millis(self.config.tick_interval_ms.max(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if !controller.running.load(Ordering::Acquire) {
                    break;
                }
                controller.tick();
            }
        });
        *self.task.lock() = Some(handle);
        info!(interval_ms = self.config.tick_interval_ms, "aimd controller started");
    }

    /// Idempotent: a second `stop()` is a no-op. In enforce mode, restores
    /// static limits on the Key Manager.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
        if self.config.mode == AdaptiveMode::Enforce {
            self.key_manager.restore_static_limits();
        }
        info!("aimd controller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(config: AdaptiveConfig) -> Arc<AimdController> {
        let km = Arc::new(KeyManager::new(vec!["sk-a".to_string()], 3, 1000));
        AimdController::new(config, km)
    }

    #[test]
    fn invalid_mode_coerces_to_observe_only() {
        assert_eq!(AdaptiveMode::parse("bogus"), AdaptiveMode::ObserveOnly);
        assert_eq!(AdaptiveMode::parse("enforce"), AdaptiveMode::Enforce);
    }

    #[test]
    fn unknown_model_is_a_no_op() {
        let c = controller(AdaptiveConfig::default());
        c.record_congestion("ghost-model", CongestionSignal::default());
        c.record_success("ghost-model");
        assert_eq!(c.effective_max("ghost-model"), None);
    }

    #[test]
    fn quota_signal_does_not_shrink() {
        // Scenario 4: effectiveMax=10, congestion with retryAfterMs=120000
        // (way above quotaRetryAfterMs) then tick -> unchanged, quota_skip.
        let mut cfg = AdaptiveConfig::default();
        cfg.min_hold_ms = 0;
        let c = controller(cfg);
        c.register_model("glm-5", 10);
        c.record_congestion_at(
            "glm-5",
            CongestionSignal {
                retry_after_ms: Some(120_000),
                ..Default::default()
            },
            1_000,
        );
        c.tick_at(2_000);
        let snap = c.snapshot("glm-5").unwrap();
        assert_eq!(snap.effective_max, 10);
        assert_eq!(snap.last_adjust_reason, "quota_skip");
    }

    #[test]
    fn congestion_decrease_and_recovery_growth() {
        // Scenario 3: staticMax=10, decreaseFactor=0.5, minHoldMs=4000,
        // recoveryDelayMs=5000, growthCleanTicks=2.
        let mut cfg = AdaptiveConfig::default();
        cfg.decrease_factor = 0.5;
        cfg.min_hold_ms = 4_000;
        cfg.recovery_delay_ms = 5_000;
        cfg.growth_clean_ticks = 2;
        let c = controller(cfg);
        c.register_model("glm-5", 10);

        c.record_congestion_at(
            "glm-5",
            CongestionSignal {
                retry_after_ms: Some(2_000),
                ..Default::default()
            },
            0,
        );
        c.tick_at(0);
        let snap = c.snapshot("glm-5").unwrap();
        assert_eq!(snap.effective_max, 5);
        assert_eq!(snap.adjustments_down, 1);

        // Advance past the recovery delay, two successes over two ticks.
        c.record_success_at("glm-5", 5_100);
        c.tick_at(5_100);
        let snap = c.snapshot("glm-5").unwrap();
        assert_eq!(snap.effective_max, 5, "first clean tick should not grow yet");
        assert_eq!(snap.consecutive_clean_ticks, 1);

        c.record_success_at("glm-5", 9_600);
        c.tick_at(9_600);
        let snap = c.snapshot("glm-5").unwrap();
        assert_eq!(snap.effective_max, 6, "second clean tick grows by one");
    }

    #[test]
    fn consecutive_clean_ticks_reset_after_congestion() {
        let mut cfg = AdaptiveConfig::default();
        cfg.min_hold_ms = 0;
        cfg.recovery_delay_ms = 0;
        let c = controller(cfg);
        c.register_model("glm-5", 10);
        c.record_success_at("glm-5", 100);
        c.tick_at(100);
        assert_eq!(c.snapshot("glm-5").unwrap().consecutive_clean_ticks, 1);

        c.record_congestion_at("glm-5", CongestionSignal::default(), 200);
        c.tick_at(200);
        assert_eq!(c.snapshot("glm-5").unwrap().consecutive_clean_ticks, 0);
    }

    #[test]
    fn anti_flap_gate_retains_accumulators() {
        let mut cfg = AdaptiveConfig::default();
        cfg.min_hold_ms = 10_000;
        let c = controller(cfg);
        c.register_model("glm-5", 10);
        c.record_congestion_at("glm-5", CongestionSignal::default(), 0);
        c.tick_at(0);
        // last_adjust_at starts unset, so the gate never suppresses the
        // very first decision for a window. This tick applies the decrease.
        let after_first = c.snapshot("glm-5").unwrap();
        assert_eq!(after_first.adjustments_down, 1);

        // Immediately signal again and tick well within the hold window:
        // the gate now suppresses processing and accumulators survive.
        c.record_congestion_at("glm-5", CongestionSignal::default(), 1_000);
        c.tick_at(1_000);
        let held = c.snapshot("glm-5").unwrap();
        assert_eq!(held.adjustments_down, 1, "gate must suppress the second tick");
    }

    #[test]
    fn effective_max_never_below_floor() {
        let mut cfg = AdaptiveConfig::default();
        cfg.min_hold_ms = 0;
        cfg.min_window = 2;
        cfg.decrease_factor = 0.1;
        let c = controller(cfg);
        c.register_model("glm-5", 10);
        for t in (0..10).map(|i| i * 10_000) {
            c.record_congestion_at("glm-5", CongestionSignal::default(), t);
            c.tick_at(t);
        }
        assert!(c.snapshot("glm-5").unwrap().effective_max >= 2);
    }

    #[test]
    fn effective_max_never_above_static_max() {
        let mut cfg = AdaptiveConfig::default();
        cfg.min_hold_ms = 0;
        cfg.recovery_delay_ms = 0;
        cfg.growth_clean_ticks = 1;
        let c = controller(cfg);
        c.register_model("glm-5", 10);
        for t in (0..20).map(|i| i * 10_000) {
            c.record_success_at("glm-5", t);
            c.tick_at(t);
        }
        assert_eq!(c.snapshot("glm-5").unwrap().effective_max, 10);
    }

    #[test]
    fn global_enforcement_scales_down_when_over_budget() {
        let mut cfg = AdaptiveConfig::default();
        cfg.global_max_concurrency = 10;
        let c = controller(cfg);
        c.register_model("a", 10);
        c.register_model("b", 10);
        c.tick_at(0);
        let a = c.snapshot("a").unwrap().effective_max;
        let b = c.snapshot("b").unwrap().effective_max;
        assert_eq!(a + b, 10);
    }

    #[test]
    fn global_enforcement_is_noop_under_budget() {
        let mut cfg = AdaptiveConfig::default();
        cfg.global_max_concurrency = 100;
        let c = controller(cfg);
        c.register_model("a", 10);
        c.register_model("b", 10);
        c.tick_at(0);
        assert_eq!(c.snapshot("a").unwrap().effective_max, 10);
        assert_eq!(c.snapshot("b").unwrap().effective_max, 10);
    }

    #[tokio::test]
    async fn start_start_stop_stop_equivalent_to_start_stop() {
        let mut cfg = AdaptiveConfig::default();
        cfg.mode = AdaptiveMode::Enforce;
        cfg.tick_interval_ms = 5;
        let km = Arc::new(KeyManager::new(vec!["sk-a".to_string()], 3, 1000));
        km.register_model("glm-5", 10);
        let c = AimdController::new(cfg, Arc::clone(&km));
        c.register_model("glm-5", 10);
        km.set_effective_model_limit("glm-5", 3);

        c.start();
        c.start();
        c.stop();
        c.stop();

        assert_eq!(km.get_effective_model_limit("glm-5"), Some(10));
    }
}
