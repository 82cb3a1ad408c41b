//! The refinement engine: one budgeted LLM call producing up to three
//! validated suggestions plus constraint chips.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use prism_config::schema::GuidedConfig;
use prism_core::{GuidedPromptMode, TraceId, run_with_deadline};
use prism_llm::ScoringRouter;
use prism_llm::scoring::SynthesisRequest;

use crate::trigger;
use crate::validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    Refine,
    Disambiguate,
    Decompose,
    Constrain,
    Sanitize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suggestion {
    pub title: String,
    pub description: String,
    pub refined_query: String,
    #[serde(rename = "type")]
    pub kind: SuggestionKind,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintChip {
    pub id: String,
    pub label: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub options: Vec<String>,
}

/// Request context forwarded from the gateway.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RefineContext {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub language: Option<String>,
    pub device_type: Option<String>,
    #[serde(default)]
    pub has_attachments: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefinementResult {
    pub should_trigger: bool,
    pub suggestions: Vec<Suggestion>,
    pub constraints: Vec<ConstraintChip>,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_used: Option<String>,
    pub cost_usd: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bypass_reason: Option<String>,
}

impl RefinementResult {
    fn bypassed(reason: &str, latency_ms: u64) -> Self {
        Self {
            should_trigger: false,
            suggestions: vec![],
            constraints: vec![],
            latency_ms,
            model_used: None,
            cost_usd: 0.0,
            bypass_reason: Some(reason.to_string()),
        }
    }
}

/// Daily spend ledger in microdollars, reset at the UTC day boundary.
struct SpendLedger {
    day: i64,
    microdollars: u64,
}

pub struct RefineEngine {
    router: Arc<ScoringRouter>,
    cfg: GuidedConfig,
    spent: Mutex<SpendLedger>,
}

impl RefineEngine {
    pub fn new(router: Arc<ScoringRouter>, cfg: GuidedConfig) -> Self {
        Self {
            router,
            cfg,
            spent: Mutex::new(SpendLedger {
                day: today(),
                microdollars: 0,
            }),
        }
    }

    /// Fraction of today's budget still unspent, in [0, 1].
    fn budget_remaining_fraction(&self) -> f64 {
        if self.cfg.daily_budget_usd <= 0.0 {
            return 0.0;
        }
        let mut ledger = self.spent.lock();
        let day = today();
        if ledger.day != day {
            ledger.day = day;
            ledger.microdollars = 0;
        }
        let spent_usd = ledger.microdollars as f64 / 1_000_000.0;
        (1.0 - spent_usd / self.cfg.daily_budget_usd).max(0.0)
    }

    fn record_spend(&self, cost_usd: f64) {
        let mut ledger = self.spent.lock();
        ledger.microdollars += (cost_usd * 1_000_000.0) as u64;
    }

    /// Run the trigger rules and, when they pass, the budgeted refinement
    /// call. Never errors: every failure path degrades to a bypass.
    pub async fn refine(
        &self,
        query: &str,
        context: &RefineContext,
        mode: GuidedPromptMode,
        trace_id: &TraceId,
        cancel: &CancellationToken,
    ) -> RefinementResult {
        let started = Instant::now();

        if !self.cfg.enabled {
            return RefinementResult::bypassed("disabled", 0);
        }
        if let Some(reason) = trigger::bypass_reason_for_mode(mode) {
            return RefinementResult::bypassed(reason, 0);
        }
        if trigger::has_bypass_keyword(query) {
            return RefinementResult::bypassed("keyword", 0);
        }
        let confidence = trigger::intent_confidence(query);
        if confidence >= self.cfg.confidence_skip_threshold {
            debug!(trace_id = %trace_id, confidence, "intent already clear, skipping refinement");
            return RefinementResult::bypassed("high_confidence", 0);
        }
        if self.budget_remaining_fraction() < 0.10 {
            return RefinementResult::bypassed("budget", 0);
        }

        let request = SynthesisRequest {
            system: Some(refinement_system_prompt().to_string()),
            prompt: refinement_prompt(query),
            max_tokens: self.cfg.max_output_tokens,
            temperature: 0.3,
            task_tags: vec![refinement_class(&self.cfg, context).to_string()],
        };

        let budget = Duration::from_millis(self.cfg.budget_ms);
        let outcome = run_with_deadline(budget, cancel, self.router.complete(&request, trace_id, cancel)).await;

        let latency_ms = started.elapsed().as_millis() as u64;
        let synthesis = match outcome {
            Ok(Ok(s)) => s,
            Ok(Err(_)) | Err(_) => {
                // Timeout, cancellation, or total provider failure all count
                // against the latency budget contract.
                return RefinementResult::bypassed("budget", latency_ms);
            }
        };

        // Per-request cost ceiling: 1% of the daily budget.
        let per_request_cap = self.cfg.daily_budget_usd * self.cfg.per_request_budget_fraction;
        if synthesis.usage.estimated_cost_usd > per_request_cap {
            self.record_spend(synthesis.usage.estimated_cost_usd);
            return RefinementResult::bypassed("budget", latency_ms);
        }
        self.record_spend(synthesis.usage.estimated_cost_usd);

        let suggestions = parse_suggestions(&synthesis.text, query);
        info!(
            trace_id = %trace_id,
            suggestions = suggestions.len(),
            latency_ms,
            model = %synthesis.model_id,
            "refinement produced"
        );

        RefinementResult {
            should_trigger: !suggestions.is_empty(),
            suggestions,
            constraints: constraint_chips(query),
            latency_ms,
            model_used: Some(synthesis.model_id),
            cost_usd: synthesis.usage.estimated_cost_usd,
            bypass_reason: None,
        }
    }
}

fn today() -> i64 {
    chrono::Utc::now().timestamp() / 86_400
}

/// Which model class serves this refinement: multimodal for attachments,
/// the quality tier when the latency budget has headroom, otherwise the
/// cheapest tier.
fn refinement_class(cfg: &GuidedConfig, context: &RefineContext) -> &'static str {
    if context.has_attachments {
        "lmm"
    } else if cfg.budget_ms >= 400 {
        "quality"
    } else {
        "fast_cheap"
    }
}

fn refinement_system_prompt() -> &'static str {
    "You refine search queries. Reply with up to three lines, each formatted as \
     kind|title|refined query. kind is one of refine, disambiguate, decompose, \
     constrain. The refined query must be a standalone search query of 5 to 20 \
     words. No commentary."
}

fn refinement_prompt(query: &str) -> String {
    format!("Original query: {query}\nSuggest refinements.")
}

/// Parse `kind|title|refined query` lines, validate, keep at most three.
fn parse_suggestions(text: &str, original_query: &str) -> Vec<Suggestion> {
    let mut suggestions = Vec::new();
    for line in text.lines() {
        let line = line.trim().trim_start_matches(|c: char| {
            c.is_ascii_digit() || c == '.' || c == ')' || c == '-' || c == ' '
        });
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(3, '|');
        let (kind_raw, title, refined) = match (parts.next(), parts.next(), parts.next()) {
            (Some(k), Some(t), Some(r)) => (k.trim(), t.trim(), r.trim()),
            // Bare line: treat the whole line as a refined query.
            _ => ("refine", "Refined query", line),
        };

        let Some(cleaned) = validate::validate_refined_query(refined) else {
            continue;
        };
        if cleaned.eq_ignore_ascii_case(original_query) {
            continue;
        }

        let kind = match kind_raw.to_lowercase().as_str() {
            "disambiguate" => SuggestionKind::Disambiguate,
            "decompose" => SuggestionKind::Decompose,
            "constrain" => SuggestionKind::Constrain,
            "sanitize" => SuggestionKind::Sanitize,
            _ => SuggestionKind::Refine,
        };

        suggestions.push(Suggestion {
            title: if title.is_empty() {
                "Refined query".into()
            } else {
                validate::redact_pii(title)
            },
            description: format!("Search instead for: {cleaned}"),
            refined_query: cleaned,
            kind,
            confidence: 0.6,
        });
        if suggestions.len() == 3 {
            break;
        }
    }
    suggestions
}

/// Deterministic constraint chips derived from the query.
fn constraint_chips(query: &str) -> Vec<ConstraintChip> {
    let mut chips = vec![ConstraintChip {
        id: "source_type".into(),
        label: "Source type".into(),
        kind: "select".into(),
        options: vec!["web".into(), "documents".into(), "knowledge graph".into()],
    }];
    let mentions_time = query
        .split_whitespace()
        .any(|w| w.chars().all(|c| c.is_ascii_digit()) && w.len() == 4)
        || query.to_lowercase().contains("recent")
        || query.to_lowercase().contains("latest");
    if mentions_time {
        chips.push(ConstraintChip {
            id: "recency".into(),
            label: "Time range".into(),
            kind: "select".into(),
            options: vec!["past year".into(), "past 5 years".into(), "any time".into()],
        });
    }
    chips
}
