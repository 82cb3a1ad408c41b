//! The full query pipeline: optional refinement, then the lane fan-out,
//! fusion, and routed synthesis. Shared by the JSON and SSE entry points;
//! the SSE path stops before synthesis and streams it instead.

use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use prism_core::{Lane, QueryRequest, Result, Source};
use prism_llm::scoring::{StreamSession, SynthesisRequest};
use prism_refine::{RefineContext, Suggestion};
use prism_retrieval::fusion;

use crate::AppState;

#[derive(Debug, Clone, Serialize)]
pub struct ProvidersOut {
    pub llm: String,
    pub model: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TimingsOut {
    pub web: u64,
    pub vector: u64,
    pub kg: u64,
    pub fusion: u64,
    pub synthesis: u64,
    pub total: u64,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub trace_id: String,
    pub answer: String,
    pub sources: Vec<Source>,
    pub providers: ProvidersOut,
    pub timings_ms: TimingsOut,
    pub warnings: Vec<String>,
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refinement_pending: Option<Vec<Suggestion>>,
}

/// Everything the pipeline produces before synthesis starts.
pub struct RetrievalPhase {
    pub fused: Vec<Source>,
    pub warnings: Vec<String>,
    pub timings: TimingsOut,
    pub refinement_pending: Option<Vec<Suggestion>>,
    pub system: String,
    pub prompt: String,
}

/// Run refinement (when the mode allows) and the retrieval fan-out, then
/// fuse. Never fails: lane trouble lands in `warnings`.
pub async fn retrieve(
    state: &AppState,
    request: &QueryRequest,
    cancel: &CancellationToken,
) -> RetrievalPhase {
    let started = Instant::now();

    // Guided prompt first; its trigger rules handle every bypass mode.
    let refinement = state
        .refine
        .refine(
            &request.query_text,
            &RefineContext {
                user_id: request.user_id.clone(),
                ..Default::default()
            },
            request.guided_prompt_mode,
            &request.trace_id,
            cancel,
        )
        .await;
    let refinement_pending = refinement.should_trigger.then_some(refinement.suggestions);

    if !state.warmup.is_ready() {
        info!(trace_id = %request.trace_id, warmup_cold = true, "serving before warmup completed");
    }

    let out = state
        .orchestrator
        .execute(&request.query_text, &request.trace_id, cancel)
        .await;

    let mut timings = TimingsOut::default();
    for result in &out.lane_results {
        state
            .metrics
            .observe_lane_latency(result.lane.as_str(), result.latency_ms as f64);
        match result.lane {
            Lane::Web => timings.web = result.latency_ms,
            Lane::Vector => timings.vector = result.latency_ms,
            Lane::Kg => timings.kg = result.latency_ms,
        }
    }

    let fusion_started = Instant::now();
    let fused = fusion::fuse(&out.lane_results, &state.fusion_config);
    timings.fusion = fusion_started.elapsed().as_millis() as u64;

    let (system, prompt) = build_synthesis_prompt(&request.query_text, &fused);

    timings.total = started.elapsed().as_millis() as u64;
    RetrievalPhase {
        fused,
        warnings: out.warnings,
        timings,
        refinement_pending,
        system,
        prompt,
    }
}

/// Full non-streaming pipeline for `POST /search`.
pub async fn run_search(
    state: &Arc<AppState>,
    request: &QueryRequest,
    cancel: &CancellationToken,
) -> Result<SearchResponse> {
    let started = Instant::now();
    let mut phase = retrieve(state, request, cancel).await;

    let synthesis_started = Instant::now();
    let outcome = state
        .router
        .complete(
            &SynthesisRequest {
                system: Some(phase.system.clone()),
                prompt: phase.prompt.clone(),
                max_tokens: request.max_tokens,
                temperature: request.temperature,
                task_tags: vec![],
            },
            &request.trace_id,
            cancel,
        )
        .await?;
    phase.timings.synthesis = synthesis_started.elapsed().as_millis() as u64;
    phase.timings.total = started.elapsed().as_millis() as u64;

    Ok(SearchResponse {
        trace_id: request.trace_id.as_str().to_string(),
        answer: outcome.text,
        sources: phase.fused,
        providers: ProvidersOut {
            llm: outcome.provider_id,
            model: outcome.model_id,
        },
        timings_ms: phase.timings,
        warnings: phase.warnings,
        degraded: outcome.degraded,
        refinement_pending: phase.refinement_pending,
    })
}

/// Streaming pipeline for `GET /stream/search`: retrieval phase plus an
/// opened synthesis stream.
pub async fn run_stream(
    state: &Arc<AppState>,
    request: &QueryRequest,
    cancel: &CancellationToken,
) -> Result<(RetrievalPhase, StreamSession)> {
    let phase = retrieve(state, request, cancel).await;
    let session = state
        .router
        .stream(
            &SynthesisRequest {
                system: Some(phase.system.clone()),
                prompt: phase.prompt.clone(),
                max_tokens: request.max_tokens,
                temperature: request.temperature,
                task_tags: vec![],
            },
            &request.trace_id,
            cancel,
        )
        .await?;
    Ok((phase, session))
}

/// Numbered-source prompt; the model cites with [n] markers.
fn build_synthesis_prompt(query: &str, sources: &[Source]) -> (String, String) {
    let system = "You answer questions using the numbered sources provided. \
                  Cite sources inline with [n] markers. If the sources do not \
                  cover the question, say so briefly."
        .to_string();

    let mut prompt = String::new();
    if sources.is_empty() {
        prompt.push_str("No sources were retrieved.\n");
    } else {
        prompt.push_str("Sources:\n");
        for (i, source) in sources.iter().enumerate() {
            prompt.push_str(&format!("[{}] {}", i + 1, source.title));
            if let Some(ref url) = source.url {
                prompt.push_str(&format!(" ({url})"));
            }
            prompt.push('\n');
            if !source.snippet.is_empty() {
                prompt.push_str(&format!("    {}\n", source.snippet));
            }
        }
    }
    prompt.push_str(&format!("\nQuestion: {query}\nAnswer:"));
    (system, prompt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_numbers_sources() {
        let mut s1 = Source::new("a", "First source", Lane::Web);
        s1.url = Some("https://a.com".into());
        s1.snippet = "alpha".into();
        let s2 = Source::new("b", "Second source", Lane::Kg);

        let (system, prompt) = build_synthesis_prompt("why?", &[s1, s2]);
        assert!(system.contains("[n]"));
        assert!(prompt.contains("[1] First source (https://a.com)"));
        assert!(prompt.contains("[2] Second source"));
        assert!(prompt.contains("Question: why?"));
    }

    #[test]
    fn test_prompt_without_sources() {
        let (_, prompt) = build_synthesis_prompt("why?", &[]);
        assert!(prompt.contains("No sources were retrieved."));
    }
}
