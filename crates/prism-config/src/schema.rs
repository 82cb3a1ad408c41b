use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration, mapped from `prism.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PrismConfig {
    pub server: ServerConfig,
    pub retrieval: RetrievalConfig,
    pub llm: LlmConfig,
    pub guided: GuidedConfig,
    pub ratelimit: RateLimitConfig,
    pub sanitize: SanitizeConfig,
    pub logging: LoggingConfig,
    pub auth: AuthConfig,
}

// ── Server ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the HTTP gateway.
    pub listen: String,
    /// Enable permissive CORS (for local UI development).
    pub cors: bool,
    /// Hosts accepted in the Host header. Empty = accept any.
    pub trusted_hosts: Vec<String>,
    /// Maximum request body size in bytes.
    pub body_limit_bytes: usize,
    /// Hard cap on a single SSE session.
    pub sse_duration_cap_secs: u64,
    /// Heartbeat cadence when no content chunk was emitted.
    pub heartbeat_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8000".into(),
            cors: false,
            trusted_hosts: vec![],
            body_limit_bytes: 10 * 1024 * 1024,
            sse_duration_cap_secs: 60,
            heartbeat_interval_ms: 5_000,
        }
    }
}

// ── Retrieval ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Total budget for the lane fan-out, in milliseconds.
    pub total_budget_ms: u64,
    pub web_timeout_ms: u64,
    pub vector_timeout_ms: u64,
    pub kg_timeout_ms: u64,
    pub fusion_timeout_ms: u64,
    /// Per-lane result caps.
    pub web_top_k: usize,
    pub vector_top_k: usize,
    pub kg_top_k: usize,
    /// Size of the fused result set.
    pub top_k_final: usize,
    pub enable_web: bool,
    pub enable_vector: bool,
    pub enable_kg: bool,
    /// Web search provider endpoint (Brave-compatible API).
    pub search_provider_url: String,
    pub search_api_key: Option<String>,
    /// Vector store (qdrant-compatible REST API).
    pub vector_db_url: Option<String>,
    pub vector_db_api_key: Option<String>,
    pub vector_collection: String,
    /// Knowledge graph store (ArangoDB HTTP API).
    pub arangodb_url: Option<String>,
    pub arangodb_username: Option<String>,
    pub arangodb_password: Option<String>,
    pub arangodb_database: String,
    /// Optional keyword index used by the web lane as a local fallback.
    pub meilisearch_url: Option<String>,
    pub meilisearch_master_key: Option<String>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            total_budget_ms: 3_000,
            web_timeout_ms: 1_500,
            vector_timeout_ms: 2_000,
            kg_timeout_ms: 1_500,
            fusion_timeout_ms: 200,
            web_top_k: 5,
            vector_top_k: 5,
            kg_top_k: 6,
            top_k_final: 10,
            enable_web: true,
            enable_vector: true,
            enable_kg: true,
            search_provider_url: "https://api.search.brave.com/res/v1/web/search".into(),
            search_api_key: None,
            vector_db_url: None,
            vector_db_api_key: None,
            vector_collection: "prism_documents".into(),
            arangodb_url: None,
            arangodb_username: None,
            arangodb_password: None,
            arangodb_database: "prism".into(),
            meilisearch_url: None,
            meilisearch_master_key: None,
        }
    }
}

// ── LLM ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Per-provider-attempt cap on a synthesis call, in seconds.
    pub timeout_secs: u64,
    /// Gates all paid-tier providers regardless of key presence.
    pub enable_paid_api: bool,
    pub ollama_base_url: Option<String>,
    pub huggingface_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    /// Remote GPU inference endpoint (OpenAI-compatible).
    pub gpu_remote_url: Option<String>,
    /// Path to the model catalog file. None = built-in catalog.
    pub catalog_path: Option<PathBuf>,
    pub default_max_tokens: u32,
    pub default_temperature: f32,
    /// Scoring weights for the router.
    pub weight_quality: f64,
    pub weight_speed: f64,
    pub weight_cost: f64,
    pub weight_context_fit: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 15,
            enable_paid_api: false,
            ollama_base_url: None,
            huggingface_api_key: None,
            openai_api_key: None,
            anthropic_api_key: None,
            gpu_remote_url: None,
            catalog_path: None,
            default_max_tokens: 1_024,
            default_temperature: 0.7,
            weight_quality: 0.40,
            weight_speed: 0.20,
            weight_cost: 0.30,
            weight_context_fit: 0.10,
        }
    }
}

// ── Guided prompt ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuidedConfig {
    pub enabled: bool,
    /// Hard wall-clock cap on one refinement, in milliseconds.
    pub budget_ms: u64,
    /// Hard cap on refinement output tokens.
    pub max_output_tokens: u32,
    /// Daily USD ceiling for refinement calls.
    pub daily_budget_usd: f64,
    /// Fraction of the daily budget one refinement may spend.
    pub per_request_budget_fraction: f64,
    /// Intent-confidence above which refinement is skipped.
    pub confidence_skip_threshold: f64,
}

impl Default for GuidedConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            budget_ms: 500,
            max_output_tokens: 300,
            daily_budget_usd: 5.0,
            per_request_budget_fraction: 0.01,
            confidence_skip_threshold: 0.8,
        }
    }
}

// ── Rate limiting ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Sustained allowance per client IP.
    pub per_minute: u32,
    /// Short-burst allowance per second.
    pub burst_per_sec: u32,
    /// How long an exhausted client stays blocked.
    pub block_secs: u64,
    /// Idle buckets older than this are swept.
    pub sweep_idle_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: 60,
            burst_per_sec: 10,
            block_secs: 300,
            sweep_idle_secs: 600,
        }
    }
}

// ── Sanitization ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SanitizeConfig {
    /// Maximum accepted query length after trimming.
    pub max_query_len: usize,
    /// Regexes that mark a query as an injection attempt.
    pub injection_patterns: Vec<String>,
}

impl Default for SanitizeConfig {
    fn default() -> Self {
        Self {
            max_query_len: 1_000,
            injection_patterns: vec![
                r"(?i)ignore\s+(all\s+)?previous\s+instructions".into(),
                r"(?i)disregard\s+(the\s+)?system\s+prompt".into(),
                r"(?i)\bact\s+as\s+(the\s+)?system\b".into(),
                r"(?i)<\s*/?\s*system\s*>".into(),
            ],
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default log level when RUST_LOG is unset.
    pub level: String,
    /// "text" or "json".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

// ── Auth ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,
    pub jwt_secret_key: Option<String>,
}

// ── Validation ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Info,
    Warning,
}

/// A non-fatal finding from config validation, logged at startup.
#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub severity: WarningSeverity,
    pub message: String,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self.severity {
            WarningSeverity::Info => "info",
            WarningSeverity::Warning => "warning",
        };
        write!(f, "config {}: {}", tag, self.message)
    }
}

fn warn(message: impl Into<String>) -> ConfigWarning {
    ConfigWarning {
        severity: WarningSeverity::Warning,
        message: message.into(),
    }
}

fn info(message: impl Into<String>) -> ConfigWarning {
    ConfigWarning {
        severity: WarningSeverity::Info,
        message: message.into(),
    }
}

impl PrismConfig {
    /// Validate the config. Returns warnings on success; an error message on
    /// hard failures that should abort startup.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();

        if self.retrieval.total_budget_ms == 0 {
            return Err("retrieval.total_budget_ms must be non-zero".into());
        }
        if self.llm.timeout_secs == 0 {
            return Err("llm.timeout_secs must be non-zero".into());
        }
        if !(0.0..=2.0).contains(&self.llm.default_temperature) {
            return Err(format!(
                "llm.default_temperature must be in 0..2, got {}",
                self.llm.default_temperature
            ));
        }
        if self.auth.enabled && self.auth.jwt_secret_key.is_none() {
            return Err("auth.enabled requires auth.jwt_secret_key (JWT_SECRET_KEY)".into());
        }

        if !self.retrieval.enable_web && !self.retrieval.enable_vector && !self.retrieval.enable_kg
        {
            warnings.push(warn(
                "all retrieval lanes disabled; answers will have no sources",
            ));
        }
        if self.retrieval.enable_vector && self.retrieval.vector_db_url.is_none() {
            warnings.push(warn(
                "vector lane enabled but retrieval.vector_db_url (VECTOR_DB_URL) is unset",
            ));
        }
        if self.retrieval.enable_kg && self.retrieval.arangodb_url.is_none() {
            warnings.push(warn(
                "kg lane enabled but retrieval.arangodb_url (ARANGODB_URL) is unset",
            ));
        }
        if self.retrieval.enable_web && self.retrieval.search_api_key.is_none() {
            warnings.push(warn(
                "web lane enabled but retrieval.search_api_key is unset",
            ));
        }
        if self.llm.enable_paid_api
            && self.llm.openai_api_key.is_none()
            && self.llm.anthropic_api_key.is_none()
        {
            warnings.push(warn(
                "paid API enabled but no paid provider key is configured",
            ));
        }
        if self.guided.budget_ms >= self.retrieval.total_budget_ms {
            warnings.push(warn(format!(
                "guided.budget_ms ({}) is not smaller than the total retrieval budget ({})",
                self.guided.budget_ms, self.retrieval.total_budget_ms
            )));
        }
        let lane_max = self
            .retrieval
            .web_timeout_ms
            .max(self.retrieval.vector_timeout_ms)
            .max(self.retrieval.kg_timeout_ms);
        if lane_max > self.retrieval.total_budget_ms {
            warnings.push(info(format!(
                "largest lane budget ({lane_max}ms) exceeds the total budget and will be clamped",
            )));
        }

        Ok(warnings)
    }
}
