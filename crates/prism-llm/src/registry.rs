//! Provider registry: which LLM backends exist, which are admissible for
//! this process, and how healthy each one currently is.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use prism_config::schema::LlmConfig;
use prism_config::{ModelCatalog, ProviderDescriptor};

use crate::anthropic::AnthropicProvider;
use crate::health::{HealthSnapshot, HealthTable};
use crate::huggingface::HuggingFaceProvider;
use crate::ollama::OllamaProvider;
use crate::openai::OpenAiProvider;
use crate::provider::LlmProvider;
use crate::stub::StubProvider;

/// Owns the provider adapters, the catalog descriptors, and the health table.
/// Shared read-only by the scoring router; health mutation is serialized
/// inside [`HealthTable`].
pub struct ProviderRegistry {
    adapters: HashMap<String, Arc<dyn LlmProvider>>,
    catalog: ModelCatalog,
    health: HealthTable,
    paid_api_enabled: bool,
}

impl ProviderRegistry {
    /// Build adapters for every backend with satisfied prerequisites. The
    /// stub is always registered.
    pub fn from_config(cfg: &LlmConfig, catalog: ModelCatalog) -> Self {
        let mut adapters: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();

        if let Some(base_url) = &cfg.ollama_base_url {
            adapters.insert(
                "ollama_local".into(),
                Arc::new(OllamaProvider::new(base_url.clone())),
            );
            info!(provider = "ollama_local", "provider registered");
        }
        if let Some(key) = &cfg.huggingface_api_key {
            adapters.insert(
                "huggingface".into(),
                Arc::new(HuggingFaceProvider::new(key.clone())),
            );
            info!(provider = "huggingface", "provider registered");
        }
        if let Some(key) = &cfg.openai_api_key {
            adapters.insert("openai".into(), Arc::new(OpenAiProvider::new(key.clone())));
            info!(provider = "openai", "provider registered");
        }
        if let Some(url) = &cfg.gpu_remote_url {
            // OpenAI-compatible remote GPU endpoint, keyless.
            adapters.insert(
                "gpu_remote".into(),
                Arc::new(OpenAiProvider::openai_compatible(
                    "gpu_remote",
                    url.clone(),
                    None,
                )),
            );
            info!(provider = "gpu_remote", "provider registered");
        }
        if let Some(key) = &cfg.anthropic_api_key {
            adapters.insert(
                "anthropic".into(),
                Arc::new(AnthropicProvider::new(key.clone())),
            );
            info!(provider = "anthropic", "provider registered");
        }

        let stub_id = catalog.stub_provider_id().to_string();
        adapters.insert(stub_id.clone(), Arc::new(StubProvider::new(stub_id)));

        Self {
            adapters,
            catalog,
            health: HealthTable::with_defaults(),
            paid_api_enabled: cfg.enable_paid_api,
        }
    }

    /// Registry over explicit adapters; the seam tests use to swap in mocks.
    pub fn with_providers(
        catalog: ModelCatalog,
        providers: Vec<Arc<dyn LlmProvider>>,
        paid_api_enabled: bool,
    ) -> Self {
        let mut adapters: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();
        for p in providers {
            adapters.insert(p.id().to_string(), p);
        }
        let stub_id = catalog.stub_provider_id().to_string();
        adapters
            .entry(stub_id.clone())
            .or_insert_with(|| Arc::new(StubProvider::new(stub_id)));
        Self {
            adapters,
            catalog,
            health: HealthTable::with_defaults(),
            paid_api_enabled,
        }
    }

    /// Providers whose prerequisites are satisfied, ordered by priority with
    /// the stub last. Pure: reads registration state only.
    pub fn list_available(&self) -> Vec<&ProviderDescriptor> {
        let mut available: Vec<&ProviderDescriptor> = self
            .catalog
            .providers
            .iter()
            .filter(|p| {
                if p.tier == prism_config::ProviderTier::Stub {
                    return true;
                }
                if p.tier.is_paid() && !self.paid_api_enabled {
                    return false;
                }
                // Adapter presence implies the key/endpoint prerequisite held.
                self.adapters.contains_key(&p.id)
            })
            .collect();
        available.sort_by_key(|p| (p.tier == prism_config::ProviderTier::Stub, p.priority));
        available
    }

    pub fn adapter(&self, provider_id: &str) -> Option<Arc<dyn LlmProvider>> {
        self.adapters.get(provider_id).cloned()
    }

    pub fn stub(&self) -> Arc<dyn LlmProvider> {
        // The stub is registered unconditionally in both constructors.
        self.adapters[self.catalog.stub_provider_id()].clone()
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    pub fn health(&self) -> &HealthTable {
        &self.health
    }

    /// Record the outcome of one provider call. Single entry point so EWMA
    /// and breaker updates can never race per provider.
    pub fn record_result(&self, provider_id: &str, success: bool, latency_ms: u64) {
        if success {
            self.health.record_success(provider_id, latency_ms);
        } else {
            self.health.record_failure(provider_id);
        }
    }

    pub fn health_snapshot(&self) -> HashMap<String, HealthSnapshot> {
        // Report every available provider, including ones never called.
        self.list_available()
            .iter()
            .map(|p| (p.id.clone(), self.health.snapshot(&p.id)))
            .collect()
    }
}
