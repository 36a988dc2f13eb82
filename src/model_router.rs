//! Maps client model -> tier -> candidate model, honors per-model cooldowns
//! and overrides, and detects context overflow (spec.md §4.6).

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use regex::Regex;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Quality,
    Balanced,
    Throughput,
}

impl Strategy {
    pub fn parse(s: &str) -> Self {
        match s {
            "throughput" => Strategy::Throughput,
            "balanced" => Strategy::Balanced,
            _ => Strategy::Quality,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Tier {
    pub name: String,
    pub models: Vec<String>,
    pub strategy: Strategy,
    pub client_model_policy: Vec<String>,
    pub fallback_models: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub model_glob: Regex,
    pub glob_source: String,
    pub tier: String,
}

#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub context_length: u64,
    /// Effective in-flight count used to break ties under `throughput`
    /// strategy; supplied by the caller (key manager) at decision time.
    pub in_flight: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowCause {
    Transient,
    Genuine,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionSource {
    Override,
    Rule,
}

#[derive(Debug, Clone)]
pub struct CandidateRejection {
    pub model: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub model: String,
    pub source: DecisionSource,
    pub tier: String,
    pub reason: String,
    pub transient_overflow: bool,
    pub genuine_overflow: bool,
    pub trace: Option<Vec<CandidateRejection>>,
    /// Which ranked complexity signal picked the tier, when resolved
    /// through a `tier: auto` rule. `None` for override/direct-tier
    /// decisions.
    pub upgrade_trigger: Option<&'static str>,
}

pub struct SelectModelInput<'a> {
    pub request_model: &'a str,
    pub body_size: u64,
    pub max_tokens: u64,
    pub attempted_models: &'a [String],
    pub override_model: Option<&'a str>,
    pub admin_auth_ok: bool,
    pub include_trace: bool,
    /// `true` when the request body carries a non-empty `tools` array —
    /// the highest-ranked complexity signal for `tier: auto` rules.
    pub has_tools: bool,
}

/// Complexity-routing parameters for rules whose tier is the literal
/// string `auto` (spec.md §4.6). Ranked `hasTools` > `longContext` >
/// `largeMaxTokens`; the first true signal selects the upgraded tier and
/// is recorded as `RoutingDecision::upgrade_trigger`.
#[derive(Debug, Clone)]
pub struct ComplexityRouting {
    pub has_tools_tier: String,
    pub long_context_tier: String,
    pub large_max_tokens_tier: String,
    pub default_tier: String,
    pub long_context_tokens: u64,
    pub large_max_tokens_threshold: u64,
}

impl ComplexityRouting {
    fn classify(&self, has_tools: bool, estimated_tokens: u64, max_tokens: u64) -> (&str, &'static str) {
        if has_tools {
            (&self.has_tools_tier, "has_tools")
        } else if estimated_tokens > self.long_context_tokens {
            (&self.long_context_tier, "long_context")
        } else if max_tokens > self.large_max_tokens_threshold {
            (&self.large_max_tokens_tier, "large_max_tokens")
        } else {
            (&self.default_tier, "default")
        }
    }
}

struct CooldownEntry {
    until_ms: u64,
    count: u32,
    burst_dampened: bool,
}

pub struct ModelRouter {
    tiers: HashMap<String, Tier>,
    rules: Vec<Rule>,
    models: RwLock<HashMap<String, ModelInfo>>,
    cooldowns: Mutex<HashMap<String, CooldownEntry>>,
    max_model_switches_per_request: u32,
    transient_overflow_retry_enabled: bool,
    shadow_mode: bool,
    last_shadow_decision: Mutex<Option<RoutingDecision>>,
    complexity_routing: Option<ComplexityRouting>,
}

impl ModelRouter {
    pub fn new(
        tiers: Vec<Tier>,
        rules: Vec<Rule>,
        max_model_switches_per_request: u32,
        transient_overflow_retry_enabled: bool,
        shadow_mode: bool,
    ) -> Self {
        Self {
            tiers: tiers.into_iter().map(|t| (t.name.clone(), t)).collect(),
            rules,
            models: RwLock::new(HashMap::new()),
            cooldowns: Mutex::new(HashMap::new()),
            max_model_switches_per_request,
            transient_overflow_retry_enabled,
            shadow_mode,
            last_shadow_decision: Mutex::new(None),
            complexity_routing: None,
        }
    }

    pub fn register_model(&self, model: &str, context_length: u64) {
        self.models.write().insert(
            model.to_string(),
            ModelInfo {
                context_length,
                in_flight: 0,
            },
        );
    }

    pub fn set_in_flight(&self, model: &str, in_flight: u32) {
        if let Some(m) = self.models.write().get_mut(model) {
            m.in_flight = in_flight;
        }
    }

    /// `burstDampened` compounds the cooldown if a record lands inside an
    /// existing cooldown window for the same model.
    pub fn record_model_cooldown(&self, model: &str, ms: u64) {
        self.record_model_cooldown_at(model, ms, now_ms());
    }

    fn record_model_cooldown_at(&self, model: &str, ms: u64, now: u64) {
        let mut cooldowns = self.cooldowns.lock();
        let entry = cooldowns.entry(model.to_string()).or_insert(CooldownEntry {
            until_ms: 0,
            count: 0,
            burst_dampened: false,
        });
        let within_existing = now < entry.until_ms;
        entry.count += 1;
        let effective_ms = if within_existing {
            entry.burst_dampened = true;
            ms.saturating_mul(2)
        } else {
            ms
        };
        entry.until_ms = now + effective_ms;
    }

    fn is_cooled_down(&self, model: &str, now: u64) -> bool {
        self.cooldowns
            .lock()
            .get(model)
            .map(|e| now < e.until_ms)
            .unwrap_or(false)
    }

    /// Returns the raw tier name named by the first matching rule, before
    /// `auto` resolution.
    fn first_matching_rule_tier(&self, request_model: &str) -> Option<&str> {
        for rule in &self.rules {
            if rule.model_glob.is_match(request_model) {
                return Some(rule.tier.as_str());
            }
        }
        None
    }

    /// Resolves a rule's tier name to a concrete `Tier`. When the name is
    /// the literal `auto` and complexity routing is configured, the ranked
    /// `hasTools`/`longContext`/`largeMaxTokens` heuristic picks the tier
    /// instead (spec.md §4.6 "Complexity routing").
    fn resolve_tier<'a>(
        &'a self,
        rule_tier: &str,
        has_tools: bool,
        estimated_tokens: u64,
        max_tokens: u64,
    ) -> Option<(&'a Tier, Option<&'static str>)> {
        if rule_tier == "auto" {
            if let Some(cr) = &self.complexity_routing {
                let (tier_name, trigger) = cr.classify(has_tools, estimated_tokens, max_tokens);
                return self.tiers.get(tier_name).map(|t| (t, Some(trigger)));
            }
        }
        self.tiers.get(rule_tier).map(|t| (t, None))
    }

    fn context_check(&self, model: &str, estimated_tokens: u64) -> bool {
        self.models
            .read()
            .get(model)
            .map(|m| estimated_tokens <= m.context_length)
            .unwrap_or(false)
    }

    fn estimated_tokens(body_size: u64, max_tokens: u64) -> u64 {
        (body_size + 3) / 4 + max_tokens
    }

    /// Decision pipeline per spec.md §4.6. Returns `None` when the router
    /// abstains (no matching rule and no catch-all) — the caller preserves
    /// the original model in that case.
    pub fn select_model(&self, input: SelectModelInput<'_>) -> Option<RoutingDecision> {
        if let Some(model) = input.override_model {
            if input.admin_auth_ok {
                return Some(RoutingDecision {
                    model: model.to_string(),
                    source: DecisionSource::Override,
                    tier: String::new(),
                    reason: "override".to_string(),
                    transient_overflow: false,
                    genuine_overflow: false,
                    trace: None,
                    upgrade_trigger: None,
                });
            }
        }

        let rule_tier = self.first_matching_rule_tier(input.request_model)?;
        let estimated_tokens = Self::estimated_tokens(input.body_size, input.max_tokens);
        let (tier, upgrade_trigger) =
            self.resolve_tier(rule_tier, input.has_tools, estimated_tokens, input.max_tokens)?;
        let tier_name = tier.name.clone();
        let now = now_ms();

        let mut candidates: Vec<String> = Vec::with_capacity(tier.models.len() + tier.fallback_models.len());
        candidates.extend(tier.models.iter().cloned());
        candidates.extend(tier.fallback_models.iter().cloned());

        let mut trace = Vec::new();

        let mut fitting: Vec<&String> = Vec::new();
        let mut any_at_capacity_overflow = false;

        for candidate in &candidates {
            if input.attempted_models.iter().any(|m| m == candidate) {
                trace.push(CandidateRejection {
                    model: candidate.clone(),
                    reason: "already_attempted".to_string(),
                });
                continue;
            }
            if self.is_cooled_down(candidate, now) {
                trace.push(CandidateRejection {
                    model: candidate.clone(),
                    reason: "cooldown".to_string(),
                });continue;
            }
            if !tier.client_model_policy.is_empty()
                && !tier.client_model_policy.iter().any(|p| p == candidate)
            {
                trace.push(CandidateRejection {
                    model: candidate.clone(),
                    reason: "client_model_policy".to_string(),
                });
                continue;
            }
            if !self.context_check(candidate, estimated_tokens) {
                // Overflows on this candidate. Distinguish transient
                // (a bigger model exists but is at cooldown/capacity)
                // from genuine by checking if any known model can fit.
                any_at_capacity_overflow = true;
                trace.push(CandidateRejection {
                    model: candidate.clone(),
                    reason: "context_overflow".to_string(),
                });
                continue;
            }
            fitting.push(candidate);
        }

        if fitting.is_empty() {
            let smallest_fitting_exists = self
                .models
                .read()
                .values()
                .any(|m| estimated_tokens <= m.context_length);
            if any_at_capacity_overflow && smallest_fitting_exists && self.transient_overflow_retry_enabled {
                let most_constrained = candidates.first().cloned().unwrap_or_default();
                return Some(RoutingDecision {
                    model: most_constrained,
                    source: DecisionSource::Rule,
                    tier: tier_name,
                    reason: "transient_overflow".to_string(),
                    transient_overflow: true,
                    genuine_overflow: false,
                    trace: input.include_trace.then_some(trace),
                    upgrade_trigger,
                });
            }
            return Some(RoutingDecision {
                model: String::new(),
                source: DecisionSource::Rule,
                tier: tier_name,
                reason: "genuine_overflow".to_string(),
                transient_overflow: false,
                genuine_overflow: true,
                trace: input.include_trace.then_some(trace),
                upgrade_trigger,
            });
        }

        let switches_used = input.attempted_models.len() as u32;
        if switches_used >= self.max_model_switches_per_request {
            return Some(RoutingDecision {
                model: String::new(),
                source: DecisionSource::Rule,
                tier: tier_name,
                reason: "routing_exhausted".to_string(),
                transient_overflow: false,
                genuine_overflow: false,
                trace: input.include_trace.then_some(trace),
                upgrade_trigger,
            });
        }

        let chosen = self.pick_by_strategy(tier.strategy, &fitting);

        let decision = RoutingDecision {
            model: chosen.clone(),
            source: DecisionSource::Rule,
            tier: tier_name,
            reason: "matched".to_string(),
            transient_overflow: false,
            genuine_overflow: false,
            trace: input.include_trace.then_some(trace),
            upgrade_trigger,
        };

        if self.shadow_mode {
            *self.last_shadow_decision.lock() = Some(decision);
            return None;
        }

        Some(decision)
    }

    fn pick_by_strategy(&self, strategy: Strategy, fitting: &[&String]) -> String {
        match strategy {
            Strategy::Quality => fitting[0].clone(),
            Strategy::Throughput => {
                let models = self.models.read();
                fitting
                    .iter()
                    .min_by_key(|m| models.get(m.as_str()).map(|i| i.in_flight).unwrap_or(0))
                    .unwrap()
                    .to_string()
            }
            Strategy::Balanced => {
                // Weighted toward list order but still considers load: the
                // first candidate wins unless it is more than twice as
                // loaded as the least-loaded fitting candidate.
                let models = self.models.read();
                let first = fitting[0];
                let first_load = models.get(first.as_str()).map(|i| i.in_flight).unwrap_or(0);
                let (best, best_load) = fitting
                    .iter()
                    .map(|m| (m, models.get(m.as_str()).map(|i| i.in_flight).unwrap_or(0)))
                    .min_by_key(|(_, load)| *load)
                    .unwrap();
                if first_load > best_load.saturating_mul(2) {
                    best.to_string()
                } else {
                    first.clone()
                }
            }
        }
    }

    pub fn get_last_shadow_decision(&self) -> Option<RoutingDecision> {
        self.last_shadow_decision.lock().clone()
    }

    /// Attaches the `tier: auto` complexity-routing heuristic. A no-op
    /// builder so existing call sites that don't use `auto` tiers are
    /// unaffected.
    pub fn with_complexity_routing(mut self, routing: ComplexityRouting) -> Self {
        self.complexity_routing = Some(routing);
        self
    }
}

impl Clone for RoutingDecision {
    fn clone(&self) -> Self {
        Self {
            model: self.model.clone(),
            source: self.source.clone(),
            tier: self.tier.clone(),
            reason: self.reason.clone(),
            transient_overflow: self.transient_overflow,
            genuine_overflow: self.genuine_overflow,
            trace: self.trace.clone(),
            upgrade_trigger: self.upgrade_trigger,
        }
    }
}

/// Compiles a simple glob (`*` as the only wildcard) into an anchored
/// regex; every other character is matched literally.
pub fn compile_rule(glob: &str, tier: &str) -> Rule {
    let escaped_parts: Vec<String> = glob.split('*').map(regex::escape).collect();
    let pattern = format!("^{}$", escaped_parts.join(".*"));
    Rule {
        model_glob: Regex::new(&pattern).unwrap_or_else(|_| Regex::new("^$").unwrap()),
        glob_source: glob.to_string(),
        tier: tier.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heavy_tier() -> Tier {
        Tier {
            name: "heavy".to_string(),
            models: vec!["glm-5".to_string()],
            strategy: Strategy::Quality,
            client_model_policy: vec![],
            fallback_models: vec![],
        }
    }

    fn router_with_heavy() -> ModelRouter {
        let router = ModelRouter::new(
            vec![heavy_tier()],
            vec![compile_rule("claude-3-opus*", "heavy"), compile_rule("*", "heavy")],
            8,
            true,
            false,
        );
        router.register_model("glm-5", 200_000);
        router
    }

    #[test]
    fn simple_proxy_maps_request_model_to_tier_model() {
        // Scenario 1.
        let router = router_with_heavy();
        let decision = router
            .select_model(SelectModelInput {
                request_model: "claude-3-opus-20240229",
                body_size: 1000,
                max_tokens: 100,
                attempted_models: &[],
                override_model: None,
                admin_auth_ok: false,
                has_tools: false,
                include_trace: false,
            })
            .unwrap();
        assert_eq!(decision.model, "glm-5");
        assert_eq!(decision.tier, "heavy");
        assert!(!decision.genuine_overflow);
    }

    #[test]
    fn no_matching_rule_and_no_catchall_abstains() {
        let router = ModelRouter::new(
            vec![heavy_tier()],
            vec![compile_rule("claude-3-opus*", "heavy")],
            8,
            true,
            false,
        );
        let decision = router.select_model(SelectModelInput {
            request_model: "totally-different-model",
            body_size: 10,
            max_tokens: 10,
            attempted_models: &[],
            override_model: None,
            admin_auth_ok: false,
            has_tools: false,
            include_trace: false,
        });
        assert!(decision.is_none());
    }

    #[test]
    fn mapped_model_not_in_attempted_models() {
        let router = router_with_heavy();
        let attempted = vec!["some-other-model".to_string()];
        let decision = router
            .select_model(SelectModelInput {
                request_model: "claude-3-opus-20240229",
                body_size: 100,
                max_tokens: 10,
                attempted_models: &attempted,
                override_model: None,
                admin_auth_ok: false,
                has_tools: false,
                include_trace: false,
            })
            .unwrap();
        assert!(!attempted.contains(&decision.model));
    }

    #[test]
    fn override_requires_admin_auth() {
        let router = router_with_heavy();
        let decision = router
            .select_model(SelectModelInput {
                request_model: "claude-3-opus-20240229",
                body_size: 100,
                max_tokens: 10,
                attempted_models: &[],
                override_model: Some("forced-model"),
                admin_auth_ok: false,
                has_tools: false,
                include_trace: false,
            })
            .unwrap();
        // Falls through to normal rule matching since auth failed.
        assert_eq!(decision.model, "glm-5");

        let decision = router
            .select_model(SelectModelInput {
                request_model: "claude-3-opus-20240229",
                body_size: 100,
                max_tokens: 10,
                attempted_models: &[],
                override_model: Some("forced-model"),
                admin_auth_ok: true,
                has_tools: false,
                include_trace: false,
            })
            .unwrap();
        assert_eq!(decision.model, "forced-model");
        assert_eq!(decision.source, DecisionSource::Override);
    }

    #[test]
    fn genuine_context_overflow() {
        // Scenario 2.
        let router = ModelRouter::new(
            vec![heavy_tier()],
            vec![compile_rule("*", "heavy")],
            8,
            true,
            false,
        );
        router.register_model("glm-5", 200_000);
        let decision = router
            .select_model(SelectModelInput {
                request_model: "claude-3-opus-20240229",
                body_size: 900_000,
                max_tokens: 8_000,
                attempted_models: &[],
                override_model: None,
                admin_auth_ok: false,
                has_tools: false,
                include_trace: true,
            })
            .unwrap();
        assert!(decision.genuine_overflow);
        assert!(!decision.transient_overflow);
    }

    #[test]
    fn transient_overflow_with_retry_flag_routes_to_larger_model_after_cooldown_expires() {
        // Scenario 5.
        let tier = Tier {
            name: "light".to_string(),
            models: vec!["glm-4.5-air".to_string(), "glm-4.7-flash".to_string()],
            strategy: Strategy::Quality,
            client_model_policy: vec![],
            fallback_models: vec![],
        };
        let router = ModelRouter::new(
            vec![tier],
            vec![compile_rule("*", "light")],
            8,
            true,
            false,
        );
        router.register_model("glm-4.5-air", 128_000);
        router.register_model("glm-4.7-flash", 200_000);
        router.record_model_cooldown_at("glm-4.7-flash", 200, 0);

        let body_size = 150_000 * 4;
        let decision = router
            .select_model(SelectModelInput {
                request_model: "claude-3-opus-20240229",
                body_size,
                max_tokens: 0,
                attempted_models: &[],
                override_model: None,
                admin_auth_ok: false,
                has_tools: false,
                include_trace: false,
            })
            .unwrap();
        assert!(decision.transient_overflow);

        // After cooldown elapses, the larger model becomes reachable.
        assert!(!router.is_cooled_down("glm-4.7-flash", 300));
    }

    #[test]
    fn cooldown_burst_dampening_compounds_duration() {
        let router = router_with_heavy();
        router.record_model_cooldown_at("glm-5", 100, 0);
        assert!(router.is_cooled_down("glm-5", 50));
        // Second record lands inside the first window: dampened (doubled).
        router.record_model_cooldown_at("glm-5", 100, 50);
        assert!(router.is_cooled_down("glm-5", 150));
    }

    #[test]
    fn routing_exhausted_when_switches_exceed_budget() {
        let router = router_with_heavy();
        let attempted: Vec<String> = (0..8).map(|i| format!("attempt-{i}")).collect();
        let decision = router
            .select_model(SelectModelInput {
                request_model: "claude-3-opus-20240229",
                body_size: 10,
                max_tokens: 10,
                attempted_models: &attempted,
                override_model: None,
                admin_auth_ok: false,
                has_tools: false,
                include_trace: false,
            })
            .unwrap();
        assert_eq!(decision.reason, "routing_exhausted");
    }

    #[test]
    fn shadow_mode_computes_but_returns_none() {
        let router = ModelRouter::new(
            vec![heavy_tier()],
            vec![compile_rule("*", "heavy")],
            8,
            true,
            true,
        );
        router.register_model("glm-5", 200_000);
        let decision = router.select_model(SelectModelInput {
            request_model: "claude-3-opus-20240229",
            body_size: 10,
            max_tokens: 10,
            attempted_models: &[],
            override_model: None,
            admin_auth_ok: false,
            has_tools: false,
            include_trace: false,
        });
        assert!(decision.is_none());
        assert!(router.get_last_shadow_decision().is_some());
    }

    #[test]
    fn throughput_strategy_picks_least_loaded_candidate() {
        let tier = Tier {
            name: "t".to_string(),
            models: vec!["a".to_string(), "b".to_string()],
            strategy: Strategy::Throughput,
            client_model_policy: vec![],
            fallback_models: vec![],
        };
        let router = ModelRouter::new(vec![tier], vec![compile_rule("*", "t")], 8, true, false);
        router.register_model("a", 100_000);
        router.register_model("b", 100_000);
        router.set_in_flight("a", 5);
        router.set_in_flight("b", 1);
        let decision = router
            .select_model(SelectModelInput {
                request_model: "x",
                body_size: 10,
                max_tokens: 10,
                attempted_models: &[],
                override_model: None,
                admin_auth_ok: false,
                has_tools: false,
                include_trace: false,
            })
            .unwrap();
        assert_eq!(decision.model, "b");
    }

    fn router_with_auto_tier() -> ModelRouter {
        let fast = Tier {
            name: "fast".to_string(),
            models: vec!["glm-5-flash".to_string()],
            strategy: Strategy::Quality,
            client_model_policy: vec![],
            fallback_models: vec![],
        };
        let tools = Tier {
            name: "tools".to_string(),
            models: vec!["glm-5-agentic".to_string()],
            strategy: Strategy::Quality,
            client_model_policy: vec![],
            fallback_models: vec![],
        };
        let long_ctx = Tier {
            name: "long-context".to_string(),
            models: vec!["glm-5-200k".to_string()],
            strategy: Strategy::Quality,
            client_model_policy: vec![],
            fallback_models: vec![],
        };
        let router = ModelRouter::new(
            vec![fast, tools, long_ctx],
            vec![compile_rule("*", "auto")],
            8,
            true,
            false,
        );
        router.register_model("glm-5-flash", 200_000);
        router.register_model("glm-5-agentic", 200_000);
        router.register_model("glm-5-200k", 200_000);
        router.with_complexity_routing(ComplexityRouting {
            has_tools_tier: "tools".to_string(),
            long_context_tier: "long-context".to_string(),
            large_max_tokens_tier: "long-context".to_string(),
            default_tier: "fast".to_string(),
            long_context_tokens: 32_000,
            large_max_tokens_threshold: 4_000,
        })
    }

    #[test]
    fn auto_tier_routes_to_has_tools_tier_when_request_carries_tools() {
        let router = router_with_auto_tier();
        let decision = router
            .select_model(SelectModelInput {
                request_model: "claude-3-sonnet",
                body_size: 100,
                max_tokens: 10,
                attempted_models: &[],
                override_model: None,
                admin_auth_ok: false,
                has_tools: true,
                include_trace: false,
            })
            .unwrap();
        assert_eq!(decision.tier, "tools");
        assert_eq!(decision.model, "glm-5-agentic");
        assert_eq!(decision.upgrade_trigger, Some("has_tools"));
    }

    #[test]
    fn auto_tier_routes_to_long_context_tier_on_large_estimated_tokens() {
        let router = router_with_auto_tier();
        let decision = router
            .select_model(SelectModelInput {
                request_model: "claude-3-sonnet",
                body_size: 400_000,
                max_tokens: 10,
                attempted_models: &[],
                override_model: None,
                admin_auth_ok: false,
                has_tools: false,
                include_trace: false,
            })
            .unwrap();
        assert_eq!(decision.tier, "long-context");
        assert_eq!(decision.upgrade_trigger, Some("long_context"));
    }

    #[test]
    fn auto_tier_falls_back_to_default_tier_with_no_signals() {
        let router = router_with_auto_tier();
        let decision = router
            .select_model(SelectModelInput {
                request_model: "claude-3-sonnet",
                body_size: 100,
                max_tokens: 10,
                attempted_models: &[],
                override_model: None,
                admin_auth_ok: false,
                has_tools: false,
                include_trace: false,
            })
            .unwrap();
        assert_eq!(decision.tier, "fast");
        assert_eq!(decision.model, "glm-5-flash");
        assert_eq!(decision.upgrade_trigger, Some("default"));
    }

    #[test]
    fn auto_tier_without_complexity_routing_configured_resolves_to_no_tier() {
        let router = ModelRouter::new(
            vec![heavy_tier()],
            vec![compile_rule("*", "auto")],
            8,
            true,
            false,
        );
        let decision = router.select_model(SelectModelInput {
            request_model: "claude-3-sonnet",
            body_size: 100,
            max_tokens: 10,
            attempted_models: &[],
            override_model: None,
            admin_auth_ok: false,
            has_tools: false,
            include_trace: false,
        });
        assert!(decision.is_none());
    }
}
