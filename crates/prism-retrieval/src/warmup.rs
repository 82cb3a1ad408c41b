//! One-shot warmup: prime the embedder and run a tiny dummy query through
//! each enabled lane so the first real request sees warmed connections.
//! Concurrent calls coalesce onto a single run; later calls get the cached
//! report.

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use prism_core::{LaneStatus, TraceId};

use crate::embedding::EmbeddingProvider;
use crate::orchestrator::LaneOrchestrator;

const WARMUP_QUERY: &str = "warmup";

#[derive(Debug, Clone, Serialize)]
pub struct WarmupStep {
    pub name: String,
    pub status: String,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WarmupReport {
    pub steps: Vec<WarmupStep>,
    pub total_ms: u64,
    pub ready: bool,
}

pub struct WarmupManager {
    report: tokio::sync::OnceCell<WarmupReport>,
    ready: AtomicBool,
}

impl WarmupManager {
    pub fn new() -> Self {
        Self {
            report: tokio::sync::OnceCell::new(),
            ready: AtomicBool::new(false),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    /// The cached report, if warmup already ran.
    pub fn report(&self) -> Option<&WarmupReport> {
        self.report.get()
    }

    /// Run warmup once per process. Concurrent callers wait for the same run.
    pub async fn warmup(
        &self,
        orchestrator: &LaneOrchestrator,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> WarmupReport {
        let report = self
            .report
            .get_or_init(|| async {
                let report = run_warmup(orchestrator, embedder).await;
                self.ready.store(true, Ordering::Relaxed);
                info!(
                    total_ms = report.total_ms,
                    ready = report.ready,
                    "warmup finished"
                );
                report
            })
            .await;
        report.clone()
    }
}

impl Default for WarmupManager {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_warmup(
    orchestrator: &LaneOrchestrator,
    embedder: Arc<dyn EmbeddingProvider>,
) -> WarmupReport {
    let started = Instant::now();
    let mut steps = Vec::new();

    // Load the embedding path first; the vector lane depends on it.
    let embed_started = Instant::now();
    let embed_step = match embedder.embed(&[WARMUP_QUERY]).await {
        Ok(_) => WarmupStep {
            name: format!("embedder:{}", embedder.name()),
            status: "ok".into(),
            latency_ms: embed_started.elapsed().as_millis() as u64,
            detail: None,
        },
        Err(e) => WarmupStep {
            name: format!("embedder:{}", embedder.name()),
            status: "error".into(),
            latency_ms: embed_started.elapsed().as_millis() as u64,
            detail: Some(e.to_string()),
        },
    };
    steps.push(embed_step);

    // One tiny query through every enabled lane warms connections and DNS.
    let trace_id = TraceId::new();
    let out = orchestrator
        .execute(WARMUP_QUERY, &trace_id, &CancellationToken::new())
        .await;
    for result in &out.lane_results {
        let status = match result.status {
            LaneStatus::Ok => "ok",
            LaneStatus::Disabled => "skipped",
            LaneStatus::Timeout | LaneStatus::Error => "error",
        };
        steps.push(WarmupStep {
            name: format!("lane:{}", result.lane),
            status: status.into(),
            latency_ms: result.latency_ms,
            detail: result.error_kind.clone(),
        });
    }

    // Ready as long as every enabled lane either answered or was skipped.
    let ready = steps.iter().all(|s| s.status != "error")
        || steps.iter().any(|s| s.status == "ok");

    WarmupReport {
        steps,
        total_ms: started.elapsed().as_millis() as u64,
        ready,
    }
}
