pub mod breakers;
pub mod health;
mod request_id;
pub mod trace;

use std::sync::Arc;

use crate::adapters::ollama::OllamaAdapter;
use crate::adapters::openai::OpenAiAdapter;
use crate::adapters::{build_http_client, AdapterError, VendorAdapter};
use crate::analytics::Analytics;
use crate::auth::{build_identity_index, resolve_user_id, ClientIdentityIndex};
use crate::cache::SemanticCache;
use crate::config::AppConfig;
use crate::policy::{PolicyEngine, RouterRules};
use crate::postcall::PostCallPipeline;
use crate::routing::picker::{AvailabilityView, ModelCatalog, VendorAvailability};
use crate::routing::Vendor;

use breakers::{GlobalBreaker, UserBreaker};
use health::VendorHealthRegistry;
use request_id::RequestIdGenerator;
use trace::TraceStore;

/// Shared application state accessible to all handlers.
pub struct AppState {
    pub config: AppConfig,
    pub policy: PolicyEngine,
    catalog: ModelCatalog,
    adapters: AdapterSet,
    resilience: ResilienceState,
    caches: CacheState,
    post: PostState,
    infra: InfraState,
}

struct AdapterSet {
    primary: Arc<dyn VendorAdapter>,
    secondary: Arc<dyn VendorAdapter>,
}

struct ResilienceState {
    health: Arc<VendorHealthRegistry>,
    global_cb: GlobalBreaker,
    user_cb: UserBreaker,
}

struct CacheState {
    semantic: Arc<SemanticCache>,
}

struct PostState {
    pipeline: Arc<PostCallPipeline>,
    analytics: Arc<Analytics>,
}

struct InfraState {
    identities: ClientIdentityIndex,
    request_ids: RequestIdGenerator,
    traces: Arc<TraceStore>,
}

impl AppState {
    #[must_use]
    pub fn new(config: AppConfig) -> Self {
        let client = build_http_client(16);
        let primary: Arc<dyn VendorAdapter> = Arc::new(OpenAiAdapter::new(
            client.clone(),
            &config.primary.base_url,
            config.primary.api_key.clone(),
            config.primary.max_streams,
        ));
        let secondary: Arc<dyn VendorAdapter> = Arc::new(OllamaAdapter::new(
            client,
            &config.secondary.base_url,
            config.secondary.max_streams,
        ));
        Self::with_adapters(config, primary, secondary)
    }

    /// Composition root seam: tests and alternative deployments inject their
    /// own adapters here.
    #[must_use]
    pub fn with_adapters(
        config: AppConfig,
        primary: Arc<dyn VendorAdapter>,
        secondary: Arc<dyn VendorAdapter>,
    ) -> Self {
        let policy = PolicyEngine::new(config.features.rules_file.clone());
        let catalog = ModelCatalog::from_config(&config);
        let identities = build_identity_index(&config);
        let analytics = Arc::new(Analytics::new());
        let semantic = Arc::new(SemanticCache::new());
        let pipeline = Arc::new(PostCallPipeline::new(
            Arc::clone(&analytics),
            Arc::clone(&semantic),
        ));

        Self {
            config,
            policy,
            catalog,
            adapters: AdapterSet { primary, secondary },
            resilience: ResilienceState {
                health: Arc::new(VendorHealthRegistry::new()),
                global_cb: GlobalBreaker::new(),
                user_cb: UserBreaker::new(),
            },
            caches: CacheState { semantic },
            post: PostState {
                pipeline,
                analytics,
            },
            infra: InfraState {
                identities,
                request_ids: RequestIdGenerator::new(),
                traces: Arc::new(TraceStore::new()),
            },
        }
    }

    #[must_use]
    pub fn rules(&self) -> Arc<RouterRules> {
        self.policy.snapshot()
    }

    #[must_use]
    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    #[must_use]
    pub fn adapter(&self, vendor: Vendor) -> &Arc<dyn VendorAdapter> {
        match vendor {
            Vendor::Primary => &self.adapters.primary,
            Vendor::Secondary => &self.adapters.secondary,
        }
    }

    #[must_use]
    pub fn next_request_id(&self) -> String {
        self.infra.request_ids.next_request_id()
    }

    #[must_use]
    pub fn trace_id_for(&self, request_id: &str) -> String {
        self.infra.request_ids.trace_uuid(request_id).to_string()
    }

    #[must_use]
    pub fn resolve_user(&self, headers: &http::HeaderMap) -> String {
        resolve_user_id(headers, &self.infra.identities)
    }

    #[must_use]
    pub fn health(&self) -> &Arc<VendorHealthRegistry> {
        &self.resilience.health
    }

    #[must_use]
    pub fn traces(&self) -> &Arc<TraceStore> {
        &self.infra.traces
    }

    #[must_use]
    pub fn semantic_cache(&self) -> &Arc<SemanticCache> {
        &self.caches.semantic
    }

    #[must_use]
    pub fn analytics(&self) -> &Arc<Analytics> {
        &self.post.analytics
    }

    #[must_use]
    pub fn postcall(&self) -> &Arc<PostCallPipeline> {
        &self.post.pipeline
    }

    /// Availability snapshot used by the picker: probe health combined with
    /// the global breakers.
    #[must_use]
    pub fn availability_view(&self) -> AvailabilityView {
        AvailabilityView {
            primary: VendorAvailability {
                healthy: self.resilience.health.is_healthy(Vendor::Primary),
                cb_open: self.resilience.global_cb.is_open(Vendor::Primary),
            },
            secondary: VendorAvailability {
                healthy: self.resilience.health.is_healthy(Vendor::Secondary),
                cb_open: self.resilience.global_cb.is_open(Vendor::Secondary),
            },
        }
    }

    #[must_use]
    pub fn global_cb_open(&self, vendor: Vendor) -> bool {
        self.resilience.global_cb.is_open(vendor)
    }

    #[must_use]
    pub fn user_cb_open(&self, user_id: &str, rules: &RouterRules) -> bool {
        self.resilience.user_cb.is_open(
            user_id,
            rules.user_cb_threshold,
            rules.user_cb_cooldown_secs,
        )
    }

    /// Feed one caller-visible outcome into both breaker layers. Probe
    /// traffic never calls this.
    pub fn record_vendor_outcome<T>(
        &self,
        vendor: Vendor,
        user_id: &str,
        rules: &RouterRules,
        result: &Result<T, AdapterError>,
    ) {
        match result {
            Ok(_) => {
                self.resilience.global_cb.record_success(vendor);
                self.resilience.user_cb.record_success(user_id);
            }
            Err(err) if counts_for_breaker(err) => {
                self.resilience.global_cb.record_failure(vendor);
                self.resilience
                    .user_cb
                    .record_failure(user_id, rules.user_cb_cooldown_secs);
            }
            Err(_) => {}
        }
    }

    /// Spawn gated health probe loops. A no-op unless startup pings are
    /// enabled in config.
    pub fn spawn_probes(&self) {
        if !self.config.features.startup_vendor_pings {
            tracing::debug!("startup vendor pings disabled; probe loops not spawned");
            return;
        }
        let timeout =
            std::time::Duration::from_secs(self.config.features.startup_check_timeout_secs);
        for vendor in [Vendor::Primary, Vendor::Secondary] {
            let registry = Arc::clone(&self.resilience.health);
            let adapter = Arc::clone(self.adapter(vendor));
            tokio::spawn(health::run_probe_loop(registry, vendor, move || {
                let adapter = Arc::clone(&adapter);
                async move { adapter.probe(timeout).await }
            }));
        }
        tracing::info!("vendor health probe loops started");
    }
}

/// Which normalized failures count toward the caller-visible breakers.
/// Client-shaped errors (provider 4xx) and cancellations do not.
fn counts_for_breaker(err: &AdapterError) -> bool {
    matches!(
        err,
        AdapterError::Timeout
            | AdapterError::Provider5xx { .. }
            | AdapterError::Network(_)
            | AdapterError::RateLimited(_)
            | AdapterError::QuotaExceeded(_)
            | AdapterError::Unknown(_)
    )
}
