//! The model catalog: declarative provider and model descriptors the
//! scoring router consumes as data. Loaded once at boot from a TOML file;
//! the built-in catalog covers the default provider set.

use serde::{Deserialize, Serialize};
use std::path::Path;

use prism_core::{PrismError, Result};

/// Provider grouping used for availability gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderTier {
    FreeLocal,
    FreeRemote,
    Paid,
    Stub,
}

impl ProviderTier {
    pub fn is_paid(&self) -> bool {
        matches!(self, Self::Paid)
    }
}

/// One LLM backend. Loaded from the catalog; availability is decided at
/// request time from configured keys and the paid-API flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub id: String,
    pub tier: ProviderTier,
    pub requires_key: bool,
    /// Scales model token cost for this provider.
    #[serde(default = "default_cost_multiplier")]
    pub cost_multiplier: f64,
    /// Lower is preferred when scores tie.
    #[serde(default)]
    pub priority: i32,
}

fn default_cost_multiplier() -> f64 {
    1.0
}

/// Capability/cost record for one model on one provider. Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub model_id: String,
    pub provider_id: String,
    /// Relative output quality in [0, 1].
    pub quality: f64,
    /// Relative speed in [0, 1]; higher is faster.
    pub speed_score: f64,
    pub cost_per_1k_tokens: f64,
    pub context_window: u32,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl ModelDescriptor {
    pub fn has_capability(&self, tag: &str) -> bool {
        self.capabilities.iter().any(|c| c == tag)
    }
}

/// The full catalog: `providers[]` and `models[]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCatalog {
    pub providers: Vec<ProviderDescriptor>,
    pub models: Vec<ModelDescriptor>,
}

impl ModelCatalog {
    /// Load a catalog file, or fall back to [`ModelCatalog::builtin`] when no
    /// path is configured.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let catalog = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p).map_err(|e| {
                    PrismError::Catalog(format!("failed to read {}: {}", p.display(), e))
                })?;
                Self::from_toml_str(&raw)?
            }
            None => Self::builtin(),
        };
        catalog.check()?;
        Ok(catalog)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| PrismError::Catalog(format!("catalog parse error: {}", e)))
    }

    /// Structural checks: unique ids, every model references a known provider,
    /// scores within range, and exactly one stub provider present.
    pub fn check(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for p in &self.providers {
            if !seen.insert(&p.id) {
                return Err(PrismError::Catalog(format!("duplicate provider id: {}", p.id)));
            }
        }
        let stub_count = self
            .providers
            .iter()
            .filter(|p| p.tier == ProviderTier::Stub)
            .count();
        if stub_count != 1 {
            return Err(PrismError::Catalog(format!(
                "catalog must contain exactly one stub provider, found {stub_count}"
            )));
        }
        for m in &self.models {
            if !self.providers.iter().any(|p| p.id == m.provider_id) {
                return Err(PrismError::Catalog(format!(
                    "model {} references unknown provider {}",
                    m.model_id, m.provider_id
                )));
            }
            if !(0.0..=1.0).contains(&m.quality) || !(0.0..=1.0).contains(&m.speed_score) {
                return Err(PrismError::Catalog(format!(
                    "model {} has out-of-range quality/speed scores",
                    m.model_id
                )));
            }
            if m.cost_per_1k_tokens < 0.0 {
                return Err(PrismError::Catalog(format!(
                    "model {} has negative cost",
                    m.model_id
                )));
            }
        }
        Ok(())
    }

    pub fn provider(&self, id: &str) -> Option<&ProviderDescriptor> {
        self.providers.iter().find(|p| p.id == id)
    }

    pub fn model(&self, model_id: &str) -> Option<&ModelDescriptor> {
        self.models.iter().find(|m| m.model_id == model_id)
    }

    pub fn models_for(&self, provider_id: &str) -> impl Iterator<Item = &ModelDescriptor> {
        self.models.iter().filter(move |m| m.provider_id == provider_id)
    }

    pub fn stub_provider_id(&self) -> &str {
        self.providers
            .iter()
            .find(|p| p.tier == ProviderTier::Stub)
            .map(|p| p.id.as_str())
            // check() guarantees presence.
            .unwrap_or("local_stub")
    }

    /// The default catalog shipped with the binary.
    pub fn builtin() -> Self {
        Self {
            providers: vec![
                ProviderDescriptor {
                    id: "ollama_local".into(),
                    tier: ProviderTier::FreeLocal,
                    requires_key: false,
                    cost_multiplier: 0.0,
                    priority: 10,
                },
                ProviderDescriptor {
                    id: "huggingface".into(),
                    tier: ProviderTier::FreeRemote,
                    requires_key: true,
                    cost_multiplier: 0.0,
                    priority: 20,
                },
                ProviderDescriptor {
                    id: "gpu_remote".into(),
                    tier: ProviderTier::FreeRemote,
                    requires_key: false,
                    cost_multiplier: 0.0,
                    priority: 15,
                },
                ProviderDescriptor {
                    id: "openai".into(),
                    tier: ProviderTier::Paid,
                    requires_key: true,
                    cost_multiplier: 1.0,
                    priority: 30,
                },
                ProviderDescriptor {
                    id: "anthropic".into(),
                    tier: ProviderTier::Paid,
                    requires_key: true,
                    cost_multiplier: 1.0,
                    priority: 30,
                },
                ProviderDescriptor {
                    id: "local_stub".into(),
                    tier: ProviderTier::Stub,
                    requires_key: false,
                    cost_multiplier: 0.0,
                    priority: 1_000,
                },
            ],
            models: vec![
                ModelDescriptor {
                    model_id: "llama3.1:8b".into(),
                    provider_id: "ollama_local".into(),
                    quality: 0.55,
                    speed_score: 0.70,
                    cost_per_1k_tokens: 0.0,
                    context_window: 128_000,
                    capabilities: vec!["chat".into(), "fast_cheap".into()],
                },
                ModelDescriptor {
                    model_id: "qwen2.5:3b".into(),
                    provider_id: "ollama_local".into(),
                    quality: 0.40,
                    speed_score: 0.90,
                    cost_per_1k_tokens: 0.0,
                    context_window: 32_768,
                    capabilities: vec!["chat".into(), "fast_cheap".into()],
                },
                ModelDescriptor {
                    model_id: "remote-llama3.1:70b".into(),
                    provider_id: "gpu_remote".into(),
                    quality: 0.72,
                    speed_score: 0.50,
                    cost_per_1k_tokens: 0.0,
                    context_window: 128_000,
                    capabilities: vec!["chat".into(), "quality".into()],
                },
                ModelDescriptor {
                    model_id: "mistralai/Mistral-7B-Instruct-v0.3".into(),
                    provider_id: "huggingface".into(),
                    quality: 0.50,
                    speed_score: 0.55,
                    cost_per_1k_tokens: 0.0,
                    context_window: 32_768,
                    capabilities: vec!["chat".into(), "fast_cheap".into()],
                },
                ModelDescriptor {
                    model_id: "gpt-4o-mini".into(),
                    provider_id: "openai".into(),
                    quality: 0.70,
                    speed_score: 0.85,
                    cost_per_1k_tokens: 0.0006,
                    context_window: 128_000,
                    capabilities: vec!["chat".into(), "fast_cheap".into(), "lmm".into()],
                },
                ModelDescriptor {
                    model_id: "gpt-4o".into(),
                    provider_id: "openai".into(),
                    quality: 0.88,
                    speed_score: 0.60,
                    cost_per_1k_tokens: 0.0100,
                    context_window: 128_000,
                    capabilities: vec!["chat".into(), "quality".into(), "lmm".into()],
                },
                ModelDescriptor {
                    model_id: "claude-3-5-haiku-latest".into(),
                    provider_id: "anthropic".into(),
                    quality: 0.72,
                    speed_score: 0.85,
                    cost_per_1k_tokens: 0.0024,
                    context_window: 200_000,
                    capabilities: vec!["chat".into(), "fast_cheap".into()],
                },
                ModelDescriptor {
                    model_id: "claude-sonnet-4-20250514".into(),
                    provider_id: "anthropic".into(),
                    quality: 0.92,
                    speed_score: 0.55,
                    cost_per_1k_tokens: 0.0090,
                    context_window: 200_000,
                    capabilities: vec!["chat".into(), "quality".into(), "lmm".into()],
                },
                ModelDescriptor {
                    model_id: "stub-small".into(),
                    provider_id: "local_stub".into(),
                    quality: 0.05,
                    speed_score: 1.0,
                    cost_per_1k_tokens: 0.0,
                    context_window: 8_192,
                    capabilities: vec!["chat".into(), "fast_cheap".into()],
                },
            ],
        }
    }
}
