//! Scoring-based model selection with health-aware failover.
//!
//! The router scores every `(provider, model)` pair from the catalog that is
//! admissible right now, picks the best, keeps up to three alternatives, and
//! walks that list on failure. When nothing is admissible or everything
//! fails, the stub provider answers; selection never errors.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use prism_config::schema::LlmConfig;
use prism_core::{DeadlineError, PrismError, Result, TraceId, run_with_deadline};

use crate::health::CircuitState;
use crate::provider::{CompletionRequest, StreamChunk, TokenUsage, approx_tokens};
use crate::registry::ProviderRegistry;

/// Penalty applied to candidates whose circuit is half-open.
const HALF_OPEN_PENALTY: f64 = 0.5;

/// What the caller knows about the request before selection.
#[derive(Debug, Clone, Default)]
pub struct RouteQuery {
    /// Estimated prompt + context size in tokens.
    pub required_context_tokens: u32,
    /// Capability tags the model must carry (e.g. "fast_cheap", "lmm").
    pub task_tags: Vec<String>,
    /// Optional ceiling on estimated cost per 1k tokens.
    pub budget_hint: Option<f64>,
}

/// One scored candidate.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub provider_id: String,
    pub model_id: String,
    pub score: f64,
}

/// The outcome of selection.
#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub provider_id: String,
    pub model_id: String,
    /// Up to three runners-up, best first.
    pub alternatives: Vec<Candidate>,
    pub reasoning: String,
}

#[derive(Debug, Clone, Copy)]
pub struct ScoringWeights {
    pub quality: f64,
    pub speed: f64,
    pub cost: f64,
    pub context_fit: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            quality: 0.40,
            speed: 0.20,
            cost: 0.30,
            context_fit: 0.10,
        }
    }
}

impl ScoringWeights {
    pub fn from_config(cfg: &LlmConfig) -> Self {
        Self {
            quality: cfg.weight_quality,
            speed: cfg.weight_speed,
            cost: cfg.weight_cost,
            context_fit: cfg.weight_context_fit,
        }
    }
}

/// A synthesis request before model selection.
#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Capability tags constraining the candidate set; empty means any chat
    /// model.
    pub task_tags: Vec<String>,
}

impl SynthesisRequest {
    fn route_query(&self) -> RouteQuery {
        let mut task_tags = self.task_tags.clone();
        if task_tags.is_empty() {
            task_tags.push("chat".into());
        }
        RouteQuery {
            required_context_tokens: approx_tokens(&self.prompt) + self.max_tokens,
            task_tags,
            budget_hint: None,
        }
    }
}

/// The result of a routed, possibly failed-over synthesis call.
#[derive(Debug, Clone)]
pub struct SynthesisOutcome {
    pub text: String,
    pub usage: TokenUsage,
    pub provider_id: String,
    pub model_id: String,
    pub latency_ms: u64,
    /// True when the answer came from the stub after real providers failed.
    pub degraded: bool,
}

/// A routed streaming session: the chunk receiver plus which model answered.
pub struct StreamSession {
    pub provider_id: String,
    pub model_id: String,
    pub rx: tokio::sync::mpsc::Receiver<StreamChunk>,
    pub degraded: bool,
}

/// Sink for per-attempt outcomes, implemented by the metrics layer.
pub trait RouteObserver: Send + Sync {
    fn on_attempt(&self, provider_id: &str, success: bool, latency_ms: u64);
}

pub struct ScoringRouter {
    registry: Arc<ProviderRegistry>,
    weights: ScoringWeights,
    /// Per-provider-attempt cap.
    attempt_timeout: Duration,
    observer: Option<Arc<dyn RouteObserver>>,
}

impl ScoringRouter {
    pub fn new(registry: Arc<ProviderRegistry>, cfg: &LlmConfig) -> Self {
        Self {
            registry,
            weights: ScoringWeights::from_config(cfg),
            attempt_timeout: Duration::from_secs(cfg.timeout_secs),
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RouteObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Single funnel for attempt outcomes: health table plus observer.
    fn record(&self, provider_id: &str, success: bool, latency_ms: u64) {
        self.registry.record_result(provider_id, success, latency_ms);
        if let Some(ref observer) = self.observer {
            observer.on_attempt(provider_id, success, latency_ms);
        }
    }

    /// Score all admissible `(provider, model)` pairs and pick the best.
    /// Logs the decision exactly once. Never fails: an empty candidate set
    /// selects the stub.
    pub fn select(&self, query: &RouteQuery, trace_id: &TraceId) -> RouteDecision {
        let catalog = self.registry.catalog();
        let health = self.registry.health();
        let w = self.weights;

        let mut candidates: Vec<(Candidate, i32, f64)> = Vec::new();
        for provider in self.registry.list_available() {
            if provider.tier == prism_config::ProviderTier::Stub {
                continue;
            }
            let state = health.state(&provider.id);
            if state == CircuitState::Open {
                continue;
            }
            for model in catalog.models_for(&provider.id) {
                if model.context_window < query.required_context_tokens {
                    continue;
                }
                if !query.task_tags.iter().all(|t| model.has_capability(t)) {
                    continue;
                }
                if let Some(ceiling) = query.budget_hint
                    && model.cost_per_1k_tokens * provider.cost_multiplier > ceiling
                {
                    continue;
                }

                let cost_term =
                    1.0 / (1.0 + model.cost_per_1k_tokens * provider.cost_multiplier);
                let context_fit = context_fit(model.context_window, query.required_context_tokens);
                let mut score = w.quality * model.quality
                    + w.speed * model.speed_score
                    + w.cost * cost_term
                    + w.context_fit * context_fit;
                if state == CircuitState::HalfOpen {
                    score -= HALF_OPEN_PENALTY;
                }

                candidates.push((
                    Candidate {
                        provider_id: provider.id.clone(),
                        model_id: model.model_id.clone(),
                        score,
                    },
                    provider.priority,
                    health.success_rate(&provider.id),
                ));
            }
        }

        // Score descending; ties by provider priority, then EWMA success
        // rate, then lexicographic model id; fully deterministic.
        candidates.sort_by(|(a, pa, ra), (b, pb, rb)| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| pa.cmp(pb))
                .then_with(|| rb.partial_cmp(ra).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| a.model_id.cmp(&b.model_id))
        });

        let decision = match candidates.first() {
            Some((best, _, _)) => {
                let alternatives: Vec<Candidate> = candidates
                    .iter()
                    .skip(1)
                    .take(3)
                    .map(|(c, _, _)| c.clone())
                    .collect();
                let reasoning = format!(
                    "selected {}/{} (score {:.3}) from {} candidates; weights q={:.2} s={:.2} c={:.2} ctx={:.2}",
                    best.provider_id,
                    best.model_id,
                    best.score,
                    candidates.len(),
                    w.quality,
                    w.speed,
                    w.cost,
                    w.context_fit,
                );
                RouteDecision {
                    provider_id: best.provider_id.clone(),
                    model_id: best.model_id.clone(),
                    alternatives,
                    reasoning,
                }
            }
            None => {
                let stub_id = catalog.stub_provider_id().to_string();
                let stub_model = catalog
                    .models_for(&stub_id)
                    .next()
                    .map(|m| m.model_id.clone())
                    .unwrap_or_else(|| "stub-small".into());
                RouteDecision {
                    provider_id: stub_id,
                    model_id: stub_model,
                    alternatives: vec![],
                    reasoning: "no admissible candidates; falling back to stub".into(),
                }
            }
        };

        info!(
            trace_id = %trace_id,
            selected_provider = %decision.provider_id,
            selected_model = %decision.model_id,
            alternatives = decision.alternatives.len(),
            reasoning = %decision.reasoning,
            "model selected"
        );
        decision
    }

    /// The ordered failover list for one decision: selected, then
    /// alternatives, then the stub as the terminal fallback.
    fn failover_order(&self, decision: &RouteDecision) -> Vec<(String, String)> {
        let stub_id = self.registry.catalog().stub_provider_id().to_string();
        let mut order = vec![(decision.provider_id.clone(), decision.model_id.clone())];
        for alt in &decision.alternatives {
            order.push((alt.provider_id.clone(), alt.model_id.clone()));
        }
        if !order.iter().any(|(p, _)| *p == stub_id) {
            let stub_model = self
                .registry
                .catalog()
                .models_for(&stub_id)
                .next()
                .map(|m| m.model_id.clone())
                .unwrap_or_else(|| "stub-small".into());
            order.push((stub_id, stub_model));
        }
        order
    }

    /// Catalog-driven cost estimate attached to usage after the call.
    fn fill_cost(&self, provider_id: &str, model_id: &str, usage: &mut TokenUsage) {
        let catalog = self.registry.catalog();
        let multiplier = catalog
            .provider(provider_id)
            .map(|p| p.cost_multiplier)
            .unwrap_or(0.0);
        if let Some(model) = catalog.model(model_id) {
            usage.estimated_cost_usd = usage.total_tokens() as f64 / 1_000.0
                * model.cost_per_1k_tokens
                * multiplier;
        }
    }

    /// Routed non-streaming synthesis: try the selected model, walk the
    /// alternatives on failure, land on the stub last. Records every
    /// attempt's outcome in the health table.
    pub async fn complete(
        &self,
        request: &SynthesisRequest,
        trace_id: &TraceId,
        cancel: &CancellationToken,
    ) -> Result<SynthesisOutcome> {
        let decision = self.select(&request.route_query(), trace_id);
        let stub_id = self.registry.catalog().stub_provider_id().to_string();

        for (provider_id, model_id) in self.failover_order(&decision) {
            if provider_id != stub_id && !self.registry.health().allow(&provider_id) {
                warn!(trace_id = %trace_id, provider = %provider_id, "skipping provider, circuit open");
                continue;
            }
            let Some(adapter) = self.registry.adapter(&provider_id) else {
                continue;
            };

            let req = CompletionRequest {
                model: model_id.clone(),
                system: request.system.clone(),
                prompt: request.prompt.clone(),
                max_tokens: request.max_tokens,
                temperature: request.temperature,
            };

            let started = Instant::now();
            info!(trace_id = %trace_id, provider = %provider_id, model = %model_id, "llm call start");
            let outcome =
                run_with_deadline(self.attempt_timeout, cancel, adapter.complete(&req)).await;
            let latency_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(Ok(resp)) => {
                    self.record(&provider_id, true, latency_ms);
                    info!(trace_id = %trace_id, provider = %provider_id, latency_ms, "llm call ok");
                    let mut usage = resp.usage;
                    self.fill_cost(&provider_id, &model_id, &mut usage);
                    return Ok(SynthesisOutcome {
                        text: resp.text,
                        usage,
                        degraded: provider_id == stub_id,
                        provider_id,
                        model_id,
                        latency_ms,
                    });
                }
                Ok(Err(e)) => {
                    self.record(&provider_id, false, latency_ms);
                    warn!(trace_id = %trace_id, provider = %provider_id, error = %e, "llm call failed, trying next candidate");
                }
                Err(DeadlineError::TimedOut) => {
                    self.record(&provider_id, false, latency_ms);
                    warn!(trace_id = %trace_id, provider = %provider_id, latency_ms, "llm call timed out, trying next candidate");
                }
                Err(DeadlineError::Cancelled) => {
                    return Err(PrismError::Provider {
                        provider: provider_id,
                        reason: "request cancelled".into(),
                    });
                }
            }
        }

        // Every path including the stub failed.
        Err(PrismError::Provider {
            provider: stub_id,
            reason: "all synthesis candidates failed".into(),
        })
    }

    /// Routed streaming synthesis. Failover happens only before the first
    /// chunk: once a provider accepts the stream, mid-stream faults surface
    /// as terminal `Error` chunks to the session layer.
    pub async fn stream(
        &self,
        request: &SynthesisRequest,
        trace_id: &TraceId,
        cancel: &CancellationToken,
    ) -> Result<StreamSession> {
        let decision = self.select(&request.route_query(), trace_id);
        let stub_id = self.registry.catalog().stub_provider_id().to_string();

        for (provider_id, model_id) in self.failover_order(&decision) {
            if provider_id != stub_id && !self.registry.health().allow(&provider_id) {
                continue;
            }
            let Some(adapter) = self.registry.adapter(&provider_id) else {
                continue;
            };

            let req = CompletionRequest {
                model: model_id.clone(),
                system: request.system.clone(),
                prompt: request.prompt.clone(),
                max_tokens: request.max_tokens,
                temperature: request.temperature,
            };

            let started = Instant::now();
            info!(trace_id = %trace_id, provider = %provider_id, model = %model_id, "llm stream start");
            match run_with_deadline(self.attempt_timeout, cancel, adapter.stream(&req)).await {
                Ok(Ok(rx)) => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    self.record(&provider_id, true, latency_ms);
                    return Ok(StreamSession {
                        degraded: provider_id == stub_id,
                        provider_id,
                        model_id,
                        rx,
                    });
                }
                Ok(Err(e)) => {
                    self.record(&provider_id, false, started.elapsed().as_millis() as u64);
                    warn!(trace_id = %trace_id, provider = %provider_id, error = %e, "llm stream open failed, trying next candidate");
                }
                Err(DeadlineError::TimedOut) => {
                    self.record(&provider_id, false, started.elapsed().as_millis() as u64);
                    warn!(trace_id = %trace_id, provider = %provider_id, "llm stream open timed out, trying next candidate");
                }
                Err(DeadlineError::Cancelled) => {
                    return Err(PrismError::Provider {
                        provider: provider_id,
                        reason: "request cancelled".into(),
                    });
                }
            }
        }

        Err(PrismError::Provider {
            provider: stub_id,
            reason: "all streaming candidates failed".into(),
        })
    }
}

/// How comfortably the request fits the model's context window, in [0, 1].
/// Full marks at 4x headroom, linear below.
fn context_fit(window: u32, required: u32) -> f64 {
    if required == 0 {
        return 1.0;
    }
    let ratio = window as f64 / (required as f64 * 4.0);
    ratio.min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockProvider;
    use prism_config::ModelCatalog;

    fn router_with(providers: Vec<Arc<dyn crate::provider::LlmProvider>>) -> ScoringRouter {
        let registry = Arc::new(ProviderRegistry::with_providers(
            ModelCatalog::builtin(),
            providers,
            true,
        ));
        ScoringRouter::new(registry, &prism_config::schema::LlmConfig::default())
    }

    fn basic_request() -> SynthesisRequest {
        SynthesisRequest {
            system: None,
            prompt: "What is photosynthesis?".into(),
            max_tokens: 256,
            temperature: 0.7,
            task_tags: vec![],
        }
    }

    #[test]
    fn test_selection_is_deterministic() {
        let router = router_with(vec![Arc::new(MockProvider::new("openai"))]);
        let q = RouteQuery {
            required_context_tokens: 1_000,
            task_tags: vec!["chat".into()],
            budget_hint: None,
        };
        let trace = TraceId::new();
        let first = router.select(&q, &trace);
        for _ in 0..100 {
            let again = router.select(&q, &trace);
            assert_eq!(again.provider_id, first.provider_id);
            assert_eq!(again.model_id, first.model_id);
        }
    }

    #[test]
    fn test_empty_candidate_set_selects_stub() {
        // No adapters registered beyond the stub, paid disabled.
        let registry = Arc::new(ProviderRegistry::with_providers(
            ModelCatalog::builtin(),
            vec![],
            false,
        ));
        let router = ScoringRouter::new(registry, &prism_config::schema::LlmConfig::default());
        let decision = router.select(&RouteQuery::default(), &TraceId::new());
        assert_eq!(decision.provider_id, "local_stub");
        assert!(decision.alternatives.is_empty());
    }

    #[test]
    fn test_context_window_filters_candidates() {
        let router = router_with(vec![Arc::new(MockProvider::new("openai"))]);
        let q = RouteQuery {
            required_context_tokens: 150_000,
            task_tags: vec!["chat".into()],
            budget_hint: None,
        };
        // Only the 200k-window models (none admissible here) or the stub fit.
        let decision = router.select(&q, &TraceId::new());
        assert_eq!(decision.provider_id, "local_stub");
    }

    #[tokio::test]
    async fn test_failover_to_stub_when_provider_errors() {
        // Two catalog models ride on the openai provider, so both failover
        // attempts must fail before the stub is reached.
        let mock = MockProvider::new("openai")
            .with_error("HTTP 500: boom")
            .with_error("HTTP 500: boom");
        let router = router_with(vec![Arc::new(mock)]);
        let out = router
            .complete(&basic_request(), &TraceId::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.provider_id, "local_stub");
        assert!(out.degraded);
        assert!(!out.text.is_empty());
    }

    #[tokio::test]
    async fn test_successful_provider_is_used() {
        let mock = MockProvider::new("openai").with_response("the answer");
        let router = router_with(vec![Arc::new(mock)]);
        let out = router
            .complete(&basic_request(), &TraceId::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.provider_id, "openai");
        assert_eq!(out.text, "the answer");
        assert!(!out.degraded);
    }

    #[tokio::test]
    async fn test_repeated_failures_open_circuit_and_skip_provider() {
        let mock = MockProvider::new("openai")
            .with_error("HTTP 500")
            .with_error("HTTP 500")
            .with_error("HTTP 500");
        let router = router_with(vec![Arc::new(mock)]);
        let trace = TraceId::new();
        let cancel = CancellationToken::new();
        for _ in 0..3 {
            let _ = router.complete(&basic_request(), &trace, &cancel).await;
        }
        assert_eq!(
            router.registry().health().state("openai"),
            CircuitState::Open
        );
        // Next selection must not offer the open provider.
        let decision = router.select(
            &RouteQuery {
                required_context_tokens: 100,
                task_tags: vec!["chat".into()],
                budget_hint: None,
            },
            &trace,
        );
        assert_ne!(decision.provider_id, "openai");
    }

    #[tokio::test]
    async fn test_cost_filled_from_catalog() {
        let mock = MockProvider::new("openai").with_response("ok");
        let router = router_with(vec![Arc::new(mock)]);
        let out = router
            .complete(&basic_request(), &TraceId::new(), &CancellationToken::new())
            .await
            .unwrap();
        // Mock reports 150 total tokens; gpt models have non-zero cost.
        assert!(out.usage.estimated_cost_usd > 0.0);
    }

    #[test]
    fn test_context_fit_scale() {
        assert_eq!(context_fit(128_000, 0), 1.0);
        assert_eq!(context_fit(8_000, 2_000), 1.0);
        assert!(context_fit(8_000, 4_000) < 1.0);
    }
}
