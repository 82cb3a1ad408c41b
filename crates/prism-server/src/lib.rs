//! # prism-server
//!
//! The HTTP/SSE gateway: wires the middleware stack (trusted host, body
//! limit, rate limiter, trace ID + security headers), binds the routes, and
//! composes the retrieval/synthesis pipeline behind them.

pub mod headers;
pub mod metrics;
pub mod pipeline;
pub mod ratelimit;
pub mod sanitize;
pub mod stream;

use axum::{
    Router,
    extract::{DefaultBodyLimit, FromRequest, Query, State},
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response, Sse},
    routing::{get, post},
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use prism_config::{ModelCatalog, PrismConfig};
use prism_core::{ErrorKind, GuidedPromptMode, PrismError, QueryRequest, TraceId};
use prism_llm::{CircuitState, ProviderRegistry, ScoringRouter};
use prism_refine::{RefineContext, RefineEngine};
use prism_retrieval::fusion::FusionConfig;
use prism_retrieval::kg::KgLane;
use prism_retrieval::vector::{CacheCounters, VectorLane};
use prism_retrieval::web::WebLane;
use prism_retrieval::{
    EmbeddingProvider, HashingEmbedding, LaneOrchestrator, RetrievalLane, WarmupManager,
};

use crate::metrics::{GaugeContext, Metrics};
use crate::ratelimit::RateLimiter;
use crate::sanitize::{Rejection, Sanitizer};
use crate::stream::{CompleteMeta, SessionOptions};

/// Shared server state: every pipeline component plus the process-global
/// tables.
pub struct AppState {
    pub config: PrismConfig,
    pub registry: Arc<ProviderRegistry>,
    pub router: Arc<ScoringRouter>,
    pub orchestrator: Arc<LaneOrchestrator>,
    pub refine: Arc<RefineEngine>,
    pub warmup: Arc<WarmupManager>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub cache_counters: Arc<CacheCounters>,
    pub fusion_config: FusionConfig,
    pub sanitizer: Sanitizer,
    pub metrics: Metrics,
    pub started_at: Instant,
}

impl AppState {
    /// Wire every component from a validated config.
    pub fn from_config(config: PrismConfig) -> prism_core::Result<Arc<Self>> {
        let catalog = ModelCatalog::load(config.llm.catalog_path.as_deref())?;
        let registry = Arc::new(ProviderRegistry::from_config(&config.llm, catalog));

        let embedder: Arc<dyn EmbeddingProvider> = if let Some(key) = &config.llm.openai_api_key {
            Arc::new(prism_retrieval::embedding::OpenAiEmbedding::new(key.clone()))
        } else if let Some(url) = &config.llm.ollama_base_url {
            Arc::new(prism_retrieval::embedding::OllamaEmbedding::new(
                url.clone(),
                "nomic-embed-text",
            ))
        } else {
            Arc::new(HashingEmbedding::default())
        };

        let cache_counters = Arc::new(CacheCounters::default());
        let web: Arc<dyn RetrievalLane> = Arc::new(WebLane::from_config(&config.retrieval));
        let vector: Arc<dyn RetrievalLane> = Arc::new(VectorLane::new(
            &config.retrieval,
            Arc::clone(&embedder),
            Arc::clone(&cache_counters),
        ));
        let kg: Arc<dyn RetrievalLane> = Arc::new(KgLane::from_config(&config.retrieval));

        Ok(Self::with_lanes(config, registry, web, vector, kg, embedder, cache_counters))
    }

    /// Wire the state around explicit lanes and registry; the seam the
    /// integration tests use to inject mocks.
    pub fn with_lanes(
        config: PrismConfig,
        registry: Arc<ProviderRegistry>,
        web: Arc<dyn RetrievalLane>,
        vector: Arc<dyn RetrievalLane>,
        kg: Arc<dyn RetrievalLane>,
        embedder: Arc<dyn EmbeddingProvider>,
        cache_counters: Arc<CacheCounters>,
    ) -> Arc<Self> {
        let metrics = Metrics::new();
        let router = Arc::new(
            ScoringRouter::new(Arc::clone(&registry), &config.llm)
                .with_observer(Arc::new(metrics.clone())),
        );
        let orchestrator = Arc::new(LaneOrchestrator::new(&config.retrieval, web, vector, kg));
        let refine = Arc::new(RefineEngine::new(
            Arc::clone(&router),
            config.guided.clone(),
        ));
        let fusion_config = FusionConfig {
            top_k_final: config.retrieval.top_k_final,
            ..FusionConfig::default()
        };
        let sanitizer = Sanitizer::from_config(&config.sanitize);

        Arc::new(Self {
            registry,
            router,
            orchestrator,
            refine,
            warmup: Arc::new(WarmupManager::new()),
            embedder,
            cache_counters,
            fusion_config,
            sanitizer,
            metrics,
            started_at: Instant::now(),
            config,
        })
    }

    fn session_options(&self) -> SessionOptions {
        SessionOptions {
            heartbeat: Duration::from_millis(self.config.server.heartbeat_interval_ms),
            cap: Duration::from_secs(self.config.server.sse_duration_cap_secs),
        }
    }
}

// ── Request/response bodies ────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SearchBody {
    query: String,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    guided_prompt_mode: Option<GuidedPromptMode>,
}

#[derive(Debug, Deserialize)]
struct StreamParams {
    query: String,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct RefineBody {
    query: String,
    #[serde(default)]
    context: RefineContext,
}

// ── Router construction ────────────────────────────────────────

/// Build the Axum router with the full middleware stack.
pub fn build_router(state: Arc<AppState>) -> Router {
    let limiter = RateLimiter::new(state.config.ratelimit.clone());

    // Background sweep for idle rate-limit buckets and health entries.
    tokio::spawn({
        let limiter = limiter.clone();
        let state = Arc::clone(&state);
        async move {
            let idle = Duration::from_secs(state.config.ratelimit.sweep_idle_secs);
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                limiter.cleanup();
                state.registry.health().sweep(idle);
                state.orchestrator.health().sweep(idle);
            }
        }
    });

    let api_routes = Router::new()
        .route("/search", post(search_handler))
        .route("/stream/search", get(stream_search_handler))
        .route("/guided-prompt/refine", post(refine_handler))
        .route("/warmup", post(warmup_handler))
        // Rate limiting applies to the query surface, not operational probes.
        .layer(middleware::from_fn(ratelimit::rate_limit_middleware))
        .layer(axum::Extension(limiter))
        .layer(axum::Extension(state.metrics.clone()));

    let router = Router::new()
        .route("/health", get(health_handler))
        .route("/health/providers", get(health_providers_handler))
        .route("/metrics", get(metrics_handler))
        .merge(api_routes)
        .with_state(Arc::clone(&state))
        .layer(DefaultBodyLimit::max(state.config.server.body_limit_bytes))
        .layer(middleware::from_fn(headers::trace_and_security_headers))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            trusted_host_middleware,
        ));

    if state.config.server.cors {
        router.layer(tower_http::cors::CorsLayer::permissive())
    } else {
        router
    }
}

/// Reject requests whose Host header is not on the configured allowlist.
/// An empty allowlist accepts any host.
async fn trusted_host_middleware(
    State(state): State<Arc<AppState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let allowed = &state.config.server.trusted_hosts;
    if !allowed.is_empty() {
        let host = req
            .headers()
            .get("host")
            .and_then(|v| v.to_str().ok())
            .map(|h| h.split(':').next().unwrap_or(h).to_string())
            .unwrap_or_default();
        if !allowed.iter().any(|a| a == &host) {
            warn!(host = %host, "rejected untrusted host");
            return (StatusCode::BAD_REQUEST, "untrusted host").into_response();
        }
    }
    next.run(req).await
}

// ── Error rendering ────────────────────────────────────────────

fn error_response(trace_id: &TraceId, err: &PrismError) -> Response {
    let kind = err.kind();
    let status = match kind {
        ErrorKind::ValidationError => StatusCode::BAD_REQUEST,
        ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    // A 500 means every path including the stub failed; the client gets the
    // generic category and a trace id, never the original message.
    let (kind_str, message) = if status == StatusCode::INTERNAL_SERVER_ERROR {
        (ErrorKind::Internal.as_str(), "internal error".to_string())
    } else {
        (kind.as_str(), err.to_string())
    };
    let body = serde_json::json!({
        "trace_id": trace_id.as_str(),
        "error_kind": kind_str,
        "message": message,
    });
    (status, Json(body)).into_response()
}

// ── Handlers ───────────────────────────────────────────────────

async fn search_handler(
    State(state): State<Arc<AppState>>,
    request: Request<axum::body::Body>,
) -> Response {
    let started = Instant::now();
    state.metrics.inc_http_requests();
    let trace_id = headers::trace_from_extensions(request.extensions());

    let body: SearchBody = match axum::Json::from_request(request, &()).await {
        Ok(axum::Json(body)) => body,
        Err(rejection) => {
            state.metrics.inc_http_errors();
            return rejection.into_response();
        }
    };

    let query_text = match state.sanitizer.sanitize(&body.query, &trace_id) {
        Ok(q) => q,
        Err((rejection, err)) => {
            if matches!(rejection, Rejection::Injection) {
                state.metrics.inc_injection_attempts();
            }
            state.metrics.inc_http_errors();
            return error_response(&trace_id, &err);
        }
    };

    let query = QueryRequest {
        query_text,
        trace_id: trace_id.clone(),
        user_id: None,
        guided_prompt_mode: body.guided_prompt_mode.unwrap_or_default(),
        max_tokens: body.max_tokens.unwrap_or(state.config.llm.default_max_tokens),
        temperature: body
            .temperature
            .unwrap_or(state.config.llm.default_temperature)
            .clamp(0.0, 2.0),
    };
    info!(trace_id = %trace_id, query_len = query.query_text.len(), "search request");

    let cancel = CancellationToken::new();
    let result = pipeline::run_search(&state, &query, &cancel).await;
    state
        .metrics
        .observe_http_duration(started.elapsed().as_millis() as f64);

    match result {
        Ok(response) => Json(response).into_response(),
        Err(err) => {
            state.metrics.inc_http_errors();
            error_response(&trace_id, &err)
        }
    }
}

async fn stream_search_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StreamParams>,
    request: Request<axum::body::Body>,
) -> Response {
    state.metrics.inc_http_requests();
    state.metrics.inc_sse_connections();
    let trace_id = headers::trace_from_extensions(request.extensions());

    let query_text = match state.sanitizer.sanitize(&params.query, &trace_id) {
        Ok(q) => q,
        Err((rejection, err)) => {
            if matches!(rejection, Rejection::Injection) {
                state.metrics.inc_injection_attempts();
            }
            state.metrics.inc_http_errors();
            return error_response(&trace_id, &err);
        }
    };

    let query = QueryRequest {
        query_text,
        trace_id: trace_id.clone(),
        user_id: None,
        guided_prompt_mode: GuidedPromptMode::Off,
        max_tokens: params
            .max_tokens
            .unwrap_or(state.config.llm.default_max_tokens),
        temperature: params
            .temperature
            .unwrap_or(state.config.llm.default_temperature)
            .clamp(0.0, 2.0),
    };
    info!(trace_id = %trace_id, "stream search request");

    let cancel = CancellationToken::new();
    let (phase, session) = match pipeline::run_stream(&state, &query, &cancel).await {
        Ok(out) => out,
        Err(err) => {
            state.metrics.inc_http_errors();
            return error_response(&trace_id, &err);
        }
    };

    let meta = CompleteMeta {
        provider_id: session.provider_id.clone(),
        model_id: session.model_id.clone(),
        citations_count: phase.fused.len(),
    };
    let stream = stream::session_stream(
        trace_id,
        session.rx,
        meta,
        state.session_options(),
        state.metrics.clone(),
        cancel.drop_guard(),
    );
    Sse::new(stream).into_response()
}

async fn refine_handler(
    State(state): State<Arc<AppState>>,
    request: Request<axum::body::Body>,
) -> Response {
    state.metrics.inc_http_requests();
    let trace_id = headers::trace_from_extensions(request.extensions());

    let body: RefineBody = match axum::Json::from_request(request, &()).await {
        Ok(axum::Json(body)) => body,
        Err(rejection) => {
            state.metrics.inc_http_errors();
            return rejection.into_response();
        }
    };

    let query_text = match state.sanitizer.sanitize(&body.query, &trace_id) {
        Ok(q) => q,
        Err((rejection, err)) => {
            if matches!(rejection, Rejection::Injection) {
                state.metrics.inc_injection_attempts();
            }
            state.metrics.inc_http_errors();
            return error_response(&trace_id, &err);
        }
    };

    let cancel = CancellationToken::new();
    let result = state
        .refine
        .refine(
            &query_text,
            &body.context,
            GuidedPromptMode::On,
            &trace_id,
            &cancel,
        )
        .await;
    Json(result).into_response()
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    state.metrics.inc_http_requests();
    let warmed = state.warmup.is_ready();
    let body = serde_json::json!({
        "status": if warmed { "ok" } else { "degraded" },
        "uptime_s": state.started_at.elapsed().as_secs(),
        "warmup": warmed,
        "version": env!("CARGO_PKG_VERSION"),
    });
    Json(body).into_response()
}

async fn health_providers_handler(State(state): State<Arc<AppState>>) -> Response {
    state.metrics.inc_http_requests();
    Json(state.registry.health_snapshot()).into_response()
}

async fn warmup_handler(State(state): State<Arc<AppState>>) -> Response {
    state.metrics.inc_http_requests();
    let report = state
        .warmup
        .warmup(&state.orchestrator, Arc::clone(&state.embedder))
        .await;
    Json(report).into_response()
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    state.metrics.inc_http_requests();

    let mut gauges = GaugeContext {
        cache_hits: state
            .cache_counters
            .hits
            .load(std::sync::atomic::Ordering::Relaxed),
        cache_misses: state
            .cache_counters
            .misses
            .load(std::sync::atomic::Ordering::Relaxed),
        lane_status: BTreeMap::new(),
        provider_circuit_state: BTreeMap::new(),
    };
    for lane in prism_core::Lane::ALL {
        let status = if !state.orchestrator.lane_enabled(lane) {
            0
        } else {
            match state.orchestrator.health().state(lane.as_str()) {
                CircuitState::Closed => 2,
                CircuitState::HalfOpen => 1,
                CircuitState::Open => 0,
            }
        };
        gauges.lane_status.insert(lane.as_str().to_string(), status);
    }
    for (provider, snapshot) in state.registry.health_snapshot() {
        let value = match snapshot.state {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        };
        gauges.provider_circuit_state.insert(provider, value);
    }

    let body = state.metrics.render_prometheus(&gauges);
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        body,
    )
        .into_response()
}

// ── Server entry ───────────────────────────────────────────────

/// Bind and serve until ctrl-c.
pub async fn start_server(state: Arc<AppState>) -> prism_core::Result<()> {
    let listen = state.config.server.listen.clone();
    let router = build_router(state);

    info!(listen = %listen, "starting HTTP gateway");
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .map_err(|e| PrismError::Config(format!("failed to bind {listen}: {e}")))?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .map_err(|e| PrismError::Config(format!("server error: {e}")))?;

    Ok(())
}
