//! Validated configuration for the proxy: key pool, AIMD tuning, model
//! routing tiers/rules, circuit breaker thresholds and observability
//! bounds (spec.md §6). Parsed once at startup from a single JSON file,
//! wrapped in an `Arc`-backed `Config` alongside the shared `reqwest::Client`
//! connection pool, the way the teacher's `ConfigFile`/`Config` split works.
//!
//! Unknown top-level fields are tolerated (no `deny_unknown_fields`), and
//! invalid enum values coerce to documented defaults rather than failing
//! config load — `adaptive.mode` uses the same hand-rolled-`Deserialize`
//! pattern the teacher uses for `TransformerEntry`'s union shape.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use crate::aimd::{AdaptiveConfig, AdaptiveMode, GrowthMode};
use crate::model_router::{compile_rule, Rule, Strategy, Tier};

fn default_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyEntryConfig {
    /// Opaque upstream secret. Never logged or serialized back out.
    pub secret: String,
    /// Per-model static concurrency ceiling for this key, if the provider
    /// enforces per-key limits narrower than the shared model window.
    #[serde(default)]
    pub models: HashMap<String, u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeysConfig {
    pub keys: Vec<KeyEntryConfig>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_backoff_ms() -> u64 {
    200
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_jitter_ratio() -> f64 {
    0.2
}
fn default_max_jitter_ms() -> u64 {
    5_000
}
fn default_queue_max_wait_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitsConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,
    #[serde(default = "default_queue_max_wait_ms")]
    pub queue_max_wait_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter_ratio: default_jitter_ratio(),
            max_jitter_ms: default_max_jitter_ms(),
            queue_max_wait_ms: default_queue_max_wait_ms(),
        }
    }
}

/// Raw JSON shape of the `adaptive` section. Deserialized into
/// `AdaptiveConfig` (which coerces the mode/growth-mode strings) by
/// `AdaptiveSectionConfig::into_adaptive_config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptiveSectionConfig {
    #[serde(default = "default_adaptive_mode")]
    pub mode: String,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_decrease_factor")]
    pub decrease_factor: f64,
    #[serde(default = "default_recovery_delay_ms")]
    pub recovery_delay_ms: u64,
    #[serde(default = "default_min_window")]
    pub min_window: u32,
    #[serde(default = "default_growth_mode")]
    pub growth_mode: String,
    #[serde(default = "default_growth_clean_ticks")]
    pub growth_clean_ticks: u32,
    #[serde(default = "default_min_hold_ms")]
    pub min_hold_ms: u64,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_idle_decay_step")]
    pub idle_decay_step: u32,
    #[serde(default = "default_quota_retry_after_ms")]
    pub quota_retry_after_ms: u64,
    #[serde(default = "default_treat_unknown_as_congestion")]
    pub treat_unknown_as_congestion: bool,
    #[serde(default)]
    pub global_max_concurrency: u32,
}

fn default_adaptive_mode() -> String {
    "observe_only".to_string()
}
fn default_tick_interval_ms() -> u64 {
    2_000
}
fn default_decrease_factor() -> f64 {
    0.5
}
fn default_recovery_delay_ms() -> u64 {
    5_000
}
fn default_min_window() -> u32 {
    1
}
fn default_growth_mode() -> String {
    "fixed_ticks".to_string()
}
fn default_growth_clean_ticks() -> u32 {
    2
}
fn default_min_hold_ms() -> u64 {
    4_000
}
fn default_idle_timeout_ms() -> u64 {
    60_000
}
fn default_idle_decay_step() -> u32 {
    1
}
fn default_quota_retry_after_ms() -> u64 {
    60_000
}
fn default_treat_unknown_as_congestion() -> bool {
    true
}

impl Default for AdaptiveSectionConfig {
    fn default() -> Self {
        Self {
            mode: default_adaptive_mode(),
            tick_interval_ms: default_tick_interval_ms(),
            decrease_factor: default_decrease_factor(),
            recovery_delay_ms: default_recovery_delay_ms(),
            min_window: default_min_window(),
            growth_mode: default_growth_mode(),
            growth_clean_ticks: default_growth_clean_ticks(),
            min_hold_ms: default_min_hold_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            idle_decay_step: default_idle_decay_step(),
            quota_retry_after_ms: default_quota_retry_after_ms(),
            treat_unknown_as_congestion: default_treat_unknown_as_congestion(),
            global_max_concurrency: 0,
        }
    }
}

impl AdaptiveSectionConfig {
    pub fn into_adaptive_config(self) -> AdaptiveConfig {
        AdaptiveConfig {
            mode: AdaptiveMode::parse(&self.mode),
            tick_interval_ms: self.tick_interval_ms,
            decrease_factor: self.decrease_factor,
            recovery_delay_ms: self.recovery_delay_ms,
            min_window: self.min_window,
            growth_mode: GrowthMode::parse(&self.growth_mode),
            growth_clean_ticks: self.growth_clean_ticks,
            min_hold_ms: self.min_hold_ms,
            idle_timeout_ms: self.idle_timeout_ms,
            idle_decay_step: self.idle_decay_step,
            quota_retry_after_ms: self.quota_retry_after_ms,
            treat_unknown_as_congestion: self.treat_unknown_as_congestion,
            global_max_concurrency: self.global_max_concurrency,
        }
    }
}

/// Concurrency/context metadata for a model known to the proxy. Neither
/// the spec's config table nor a single section covers this directly —
/// it's the union of what `KeyManager::register_model` (static
/// concurrency) and `ModelRouter::register_model` (context length) each
/// need; see DESIGN.md's Open Question log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDef {
    #[serde(default = "default_static_max_concurrency")]
    pub static_max_concurrency: u32,
    #[serde(default = "default_context_length")]
    pub context_length: u64,
}

fn default_static_max_concurrency() -> u32 {
    10
}
fn default_context_length() -> u64 {
    200_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierConfig {
    pub models: Vec<String>,
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default)]
    pub client_model_policy: Vec<String>,
    #[serde(default)]
    pub fallback_models: Vec<String>,
}

fn default_strategy() -> String {
    "quality".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    #[serde(rename = "match")]
    pub match_: RuleMatchConfig,
    pub tier: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleMatchConfig {
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FailoverConfig {
    #[serde(default = "default_max_model_switches")]
    pub max_model_switches_per_request: u32,
}

fn default_max_model_switches() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TransientOverflowRetryConfig {
    #[serde(default)]
    pub enabled: bool,
}

/// Complexity-routing targets for rules whose `tier` is the literal
/// string `auto` (spec.md §4.6). Opt-in: absent unless the config names
/// it, in which case `auto` rules resolve through this ranked
/// `hasTools`/`longContext`/`largeMaxTokens` heuristic instead of a fixed
/// tier lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoTierConfig {
    pub has_tools_tier: String,
    pub long_context_tier: String,
    pub large_max_tokens_tier: String,
    pub default_tier: String,
    #[serde(default = "default_long_context_tokens")]
    pub long_context_tokens: u64,
    #[serde(default = "default_large_max_tokens_threshold")]
    pub large_max_tokens_threshold: u64,
}

fn default_long_context_tokens() -> u64 {
    32_000
}
fn default_large_max_tokens_threshold() -> u64 {
    4_000
}

impl AutoTierConfig {
    pub fn into_complexity_routing(self) -> crate::model_router::ComplexityRouting {
        crate::model_router::ComplexityRouting {
            has_tools_tier: self.has_tools_tier,
            long_context_tier: self.long_context_tier,
            large_max_tokens_tier: self.large_max_tokens_tier,
            default_tier: self.default_tier,
            long_context_tokens: self.long_context_tokens,
            large_max_tokens_threshold: self.large_max_tokens_threshold,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRoutingConfig {
    #[serde(default = "default_routing_version")]
    pub version: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub tiers: HashMap<String, TierConfig>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    #[serde(default)]
    pub failover: FailoverConfig,
    #[serde(default)]
    pub transient_overflow_retry: TransientOverflowRetryConfig,
    #[serde(default)]
    pub log_decisions: bool,
    #[serde(default)]
    pub shadow_mode: bool,
    #[serde(default)]
    pub models: HashMap<String, ModelDef>,
    #[serde(default)]
    pub auto_tier: Option<AutoTierConfig>,
}

fn default_routing_version() -> u32 {
    1
}
fn default_true() -> bool {
    true
}

impl Default for ModelRoutingConfig {
    fn default() -> Self {
        Self {
            version: default_routing_version(),
            enabled: true,
            tiers: HashMap::new(),
            rules: Vec::new(),
            failover: FailoverConfig::default(),
            transient_overflow_retry: TransientOverflowRetryConfig::default(),
            log_decisions: false,
            shadow_mode: false,
            models: HashMap::new(),
            auto_tier: None,
        }
    }
}

impl ModelRoutingConfig {
    pub fn build_tiers(&self) -> Vec<Tier> {
        self.tiers
            .iter()
            .map(|(name, t)| Tier {
                name: name.clone(),
                models: t.models.clone(),
                strategy: Strategy::parse(&t.strategy),
                client_model_policy: t.client_model_policy.clone(),
                fallback_models: t.fallback_models.clone(),
            })
            .collect()
    }

    /// Rules are evaluated top-to-bottom; a `*` catch-all must be last or
    /// unmatched requests fail (spec.md §3). We don't enforce that here —
    /// the router simply abstains (returns `None`) and the caller keeps
    /// the client's original model, matching spec.md §4.6 step 2.
    pub fn build_rules(&self) -> Vec<Rule> {
        self.rules
            .iter()
            .map(|r| compile_rule(&r.match_.model, &r.tier))
            .collect()
    }
}

fn default_failure_threshold() -> u64 {
    5
}
fn default_open_duration_ms() -> u64 {
    30_000
}
fn default_half_open_probes() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u64,
    #[serde(default = "default_open_duration_ms")]
    pub open_duration_ms: u64,
    #[serde(default = "default_half_open_probes")]
    pub half_open_probes: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_duration_ms: default_open_duration_ms(),
            half_open_probes: default_half_open_probes(),
        }
    }
}

fn default_trace_capacity() -> usize {
    2_000
}
fn default_payload_cache_capacity() -> usize {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_trace_capacity")]
    pub trace_capacity: usize,
    #[serde(default = "default_payload_cache_capacity")]
    pub payload_cache_capacity: usize,
    #[serde(default = "default_true")]
    pub redact_bodies: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            trace_capacity: default_trace_capacity(),
            payload_cache_capacity: default_payload_cache_capacity(),
            redact_bodies: true,
        }
    }
}

/// `x-model-override` is only honored when an admin token is configured
/// and the caller presents it, or when no token is configured at all
/// (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AdminConfig {
    #[serde(default)]
    pub token: Option<String>,
}

fn default_port() -> u16 {
    8787
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_api_timeout_ms() -> u64 {
    120_000
}
fn default_pool_max_idle_per_host() -> usize {
    32
}
fn default_shutdown_grace_ms() -> u64 {
    30_000
}

/// Parsed JSON configuration (deserializable). Field names intentionally
/// match spec.md §6's section table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    pub keys: KeysConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub adaptive: AdaptiveSectionConfig,

    #[serde(default)]
    pub model_routing: ModelRoutingConfig,

    #[serde(default)]
    pub circuit: CircuitConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,

    #[serde(default)]
    pub admin: AdminConfig,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_api_timeout_ms")]
    pub api_timeout_ms: u64,

    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

/// Runtime configuration shared across all handlers via Axum state. Wraps
/// the parsed config plus a shared `reqwest::Client` connection pool, one
/// pool for every upstream call, the way the teacher's `Config` does.
#[derive(Debug, Clone)]
pub struct Config {
    inner: Arc<ConfigInner>,
}

#[derive(Debug)]
struct ConfigInner {
    file: ConfigFile,
    http_client: reqwest::Client,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let content =
            fs::read_to_string(path).context(format!("Failed to read config file: {}", path))?;
        Self::from_str(&content)
    }

    pub fn from_str(content: &str) -> Result<Self> {
        let file: ConfigFile =
            serde_json::from_str(content).context("Failed to parse config JSON")?;
        Self::from_file_config(file)
    }

    pub fn from_file_config(file: ConfigFile) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(file.api_timeout_ms))
            .pool_max_idle_per_host(file.pool_max_idle_per_host)
            .tcp_keepalive(std::time::Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()?;

        Ok(Config {
            inner: Arc::new(ConfigInner { file, http_client }),
        })
    }

    pub fn file(&self) -> &ConfigFile {
        &self.inner.file
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.inner.http_client
    }

    pub fn base_url(&self) -> &str {
        &self.inner.file.keys.base_url
    }

    pub fn admin_token(&self) -> Option<&str> {
        self.inner.file.admin.token.as_deref()
    }

    /// An override header is admitted when no admin token is configured at
    /// all, or when the presented token matches exactly (spec.md §6).
    pub fn admin_auth_ok(&self, presented: Option<&str>) -> bool {
        match self.admin_token() {
            None => true,
            Some(expected) => presented == Some(expected),
        }
    }
}
