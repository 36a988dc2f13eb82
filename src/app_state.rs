//! Shared application state handed to every Axum handler: the component
//! set the forwarder orchestrates, plus the config it was built from.

use std::sync::Arc;
use std::time::Instant;

use crate::aimd::AimdController;
use crate::config::Config;
use crate::key_manager::KeyManager;
use crate::model_router::ModelRouter;
use crate::trace::{PayloadCache, TraceRingBuffer};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub key_manager: Arc<KeyManager>,
    pub aimd: Arc<AimdController>,
    pub router: Arc<ModelRouter>,
    pub traces: Arc<TraceRingBuffer>,
    pub payload_cache: Arc<PayloadCache>,
    pub started_at: Instant,
}

impl AppState {
    /// Builds every component from `config` and registers configured
    /// models' static concurrency and context length with both the Key
    /// Manager and the Model Router, so neither treats them as unknown.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let file = config.file();

        let secrets: Vec<String> = file.keys.keys.iter().map(|k| k.secret.clone()).collect();
        let key_manager = Arc::new(KeyManager::new(
            secrets,
            file.circuit.failure_threshold,
            file.circuit.open_duration_ms,
        ));

        let tiers = file.model_routing.build_tiers();
        let rules = file.model_routing.build_rules();
        let mut router = ModelRouter::new(
            tiers,
            rules,
            file.model_routing.failover.max_model_switches_per_request,
            file.model_routing.transient_overflow_retry.enabled,
            file.model_routing.shadow_mode,
        );
        if let Some(auto_tier) = file.model_routing.auto_tier.clone() {
            router = router.with_complexity_routing(auto_tier.into_complexity_routing());
        }
        let router = Arc::new(router);

        for (model, def) in &file.model_routing.models {
            key_manager.register_model(model, def.static_max_concurrency);
            router.register_model(model, def.context_length);
        }

        let adaptive = file.adaptive.clone().into_adaptive_config();
        let aimd = AimdController::new(adaptive, Arc::clone(&key_manager));
        for (model, def) in &file.model_routing.models {
            aimd.register_model(model, def.static_max_concurrency);
        }

        let traces = Arc::new(TraceRingBuffer::new(file.observability.trace_capacity));
        let payload_cache = Arc::new(PayloadCache::new(file.observability.payload_cache_capacity));

        Ok(Self {
            config,
            key_manager,
            aimd,
            router,
            traces,
            payload_cache,
            started_at: Instant::now(),
        })
    }
}
