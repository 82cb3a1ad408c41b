//! Parallel lane fan-out under a total deadline.
//!
//! All enabled lanes start together; the coordinator awaits them with a
//! bounded overall budget. A lane that overruns its clamped budget is marked
//! `timeout` and its eventual result is dropped; nothing a late task
//! produces can leak into the output. Any combination of lane failures is
//! acceptable; the orchestrator itself never fails.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use prism_config::schema::RetrievalConfig;
use prism_core::{
    Deadline, DeadlineError, Lane, LaneRequest, LaneResult, LaneStatus, TraceId, run_with_deadline,
};
use prism_llm::HealthTable;

use crate::lane::RetrievalLane;

/// What one fan-out produced: results in the fixed {web, vector, kg} order,
/// plus warnings suitable for the response body.
#[derive(Debug)]
pub struct OrchestratorOutput {
    pub lane_results: Vec<LaneResult>,
    pub warnings: Vec<String>,
    pub total_latency_ms: u64,
}

impl OrchestratorOutput {
    pub fn result_for(&self, lane: Lane) -> Option<&LaneResult> {
        self.lane_results.iter().find(|r| r.lane == lane)
    }

    /// True when at least one lane produced items.
    pub fn any_items(&self) -> bool {
        self.lane_results.iter().any(|r| !r.items.is_empty())
    }
}

struct LaneSlot {
    adapter: Arc<dyn RetrievalLane>,
    enabled: bool,
    budget_ms: u64,
    top_k: usize,
}

pub struct LaneOrchestrator {
    slots: HashMap<Lane, LaneSlot>,
    total_budget: Duration,
    /// Per-lane circuit breakers, independent from the provider table.
    health: HealthTable,
}

impl LaneOrchestrator {
    pub fn new(
        cfg: &RetrievalConfig,
        web: Arc<dyn RetrievalLane>,
        vector: Arc<dyn RetrievalLane>,
        kg: Arc<dyn RetrievalLane>,
    ) -> Self {
        let mut slots = HashMap::new();
        slots.insert(
            Lane::Web,
            LaneSlot {
                adapter: web,
                enabled: cfg.enable_web,
                budget_ms: cfg.web_timeout_ms,
                top_k: cfg.web_top_k,
            },
        );
        slots.insert(
            Lane::Vector,
            LaneSlot {
                adapter: vector,
                enabled: cfg.enable_vector,
                budget_ms: cfg.vector_timeout_ms,
                top_k: cfg.vector_top_k,
            },
        );
        slots.insert(
            Lane::Kg,
            LaneSlot {
                adapter: kg,
                enabled: cfg.enable_kg,
                budget_ms: cfg.kg_timeout_ms,
                top_k: cfg.kg_top_k,
            },
        );
        Self {
            slots,
            total_budget: Duration::from_millis(cfg.total_budget_ms),
            health: HealthTable::with_defaults(),
        }
    }

    pub fn health(&self) -> &HealthTable {
        &self.health
    }

    pub fn lane_enabled(&self, lane: Lane) -> bool {
        self.slots.get(&lane).is_some_and(|s| s.enabled)
    }

    /// Fan out to every enabled lane and gather what lands inside the
    /// deadline. Iteration and output order is fixed to {web, vector, kg}.
    pub async fn execute(&self, query: &str, trace_id: &TraceId, cancel: &CancellationToken) -> OrchestratorOutput {
        let started = Instant::now();
        let deadline = Deadline::new(self.total_budget);
        let mut warnings = Vec::new();
        let mut pending = Vec::new();

        for lane in Lane::ALL {
            // Lane::ALL covers every key inserted in new().
            let slot = &self.slots[&lane];
            if !slot.enabled {
                warnings.push(format!("lane_disabled:{lane}"));
                pending.push((lane, None, LaneResult::disabled(lane)));
                continue;
            }
            if !self.health.allow(lane.as_str()) {
                warn!(trace_id = %trace_id, lane = %lane, "lane circuit open, skipping");
                warnings.push(format!("lane_circuit_open:{lane}"));
                pending.push((
                    lane,
                    None,
                    LaneResult::error(lane, 0, "circuit_open"),
                ));
                continue;
            }

            let budget_ms = slot.budget_ms.min(deadline.remaining_ms());
            let request = LaneRequest {
                query_text: query.to_string(),
                top_k: slot.top_k,
                deadline_ms: budget_ms,
                trace_id: trace_id.clone(),
            };
            let adapter = Arc::clone(&slot.adapter);
            let lane_cancel = cancel.child_token();
            info!(trace_id = %trace_id, lane = %lane, budget_ms, "lane start");

            let handle = tokio::spawn(async move {
                let lane_started = Instant::now();
                match run_with_deadline(
                    Duration::from_millis(budget_ms),
                    &lane_cancel,
                    adapter.search(&request),
                )
                .await
                {
                    Ok(mut result) => {
                        result.items.truncate(request.top_k);
                        result
                    }
                    Err(DeadlineError::TimedOut) => {
                        LaneResult::timeout(lane, lane_started.elapsed().as_millis() as u64)
                    }
                    Err(DeadlineError::Cancelled) => {
                        LaneResult::timeout(lane, lane_started.elapsed().as_millis() as u64)
                    }
                }
            });
            pending.push((lane, Some(handle), LaneResult::disabled(lane)));
        }

        let mut lane_results = Vec::with_capacity(3);
        for (lane, handle, placeholder) in pending {
            let result = match handle {
                None => placeholder,
                Some(handle) => {
                    let abort = handle.abort_handle();
                    match run_with_deadline(deadline.remaining(), cancel, handle).await {
                        Ok(Ok(result)) => result,
                        Ok(Err(join_err)) => {
                            warn!(trace_id = %trace_id, lane = %lane, error = %join_err, "lane task failed");
                            LaneResult::error(lane, deadline.elapsed_ms(), "lane_error")
                        }
                        Err(_) => {
                            // Overall deadline hit: drop the task, discard
                            // whatever it produces later.
                            abort.abort();
                            LaneResult::timeout(lane, deadline.elapsed_ms())
                        }
                    }
                }
            };

            match result.status {
                LaneStatus::Ok => self.health.record_success(lane.as_str(), result.latency_ms),
                LaneStatus::Timeout => {
                    warnings.push(format!("lane_timeout:{lane}"));
                    self.health.record_failure(lane.as_str());
                }
                LaneStatus::Error => {
                    if result.error_kind.as_deref() != Some("circuit_open") {
                        warnings.push(format!("lane_error:{lane}"));
                        self.health.record_failure(lane.as_str());
                    }
                }
                LaneStatus::Disabled => {}
            }

            info!(
                trace_id = %trace_id,
                lane = %lane,
                status = ?result.status,
                items = result.items.len(),
                latency_ms = result.latency_ms,
                "lane end"
            );
            lane_results.push(result);
        }

        OrchestratorOutput {
            lane_results,
            warnings,
            total_latency_ms: started.elapsed().as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockLane;

    fn orchestrator_with(
        cfg: RetrievalConfig,
        web: MockLane,
        vector: MockLane,
        kg: MockLane,
    ) -> LaneOrchestrator {
        LaneOrchestrator::new(&cfg, Arc::new(web), Arc::new(vector), Arc::new(kg))
    }

    fn fast_config() -> RetrievalConfig {
        RetrievalConfig {
            total_budget_ms: 500,
            web_timeout_ms: 200,
            vector_timeout_ms: 200,
            kg_timeout_ms: 200,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_all_lanes_contribute_in_fixed_order() {
        let orch = orchestrator_with(
            fast_config(),
            MockLane::with_items(Lane::Web, 3),
            MockLane::with_items(Lane::Vector, 3),
            MockLane::with_items(Lane::Kg, 2),
        );
        let out = orch
            .execute("query", &TraceId::new(), &CancellationToken::new())
            .await;
        let lanes: Vec<Lane> = out.lane_results.iter().map(|r| r.lane).collect();
        assert_eq!(lanes, vec![Lane::Web, Lane::Vector, Lane::Kg]);
        assert!(out.any_items());
        assert!(out.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_sleeping_lane_times_out_without_blocking_others() {
        let started = Instant::now();
        let orch = orchestrator_with(
            fast_config(),
            MockLane::with_items(Lane::Web, 2),
            MockLane::with_items(Lane::Vector, 2).with_delay(Duration::from_secs(30)),
            MockLane::with_items(Lane::Kg, 2),
        );
        let out = orch
            .execute("query", &TraceId::new(), &CancellationToken::new())
            .await;

        // The fan-out finishes near the slowest *bounded* budget, far below
        // the sleeping lane's delay.
        assert!(started.elapsed() < Duration::from_secs(2));
        let vector = out.result_for(Lane::Vector).unwrap();
        assert_eq!(vector.status, LaneStatus::Timeout);
        assert!(vector.items.is_empty());
        assert!(out.warnings.iter().any(|w| w == "lane_timeout:vector"));
        assert!(!out.result_for(Lane::Web).unwrap().items.is_empty());
        assert!(!out.result_for(Lane::Kg).unwrap().items.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_lanes_report_immediately() {
        let cfg = RetrievalConfig {
            enable_vector: false,
            enable_kg: false,
            ..fast_config()
        };
        let orch = orchestrator_with(
            cfg,
            MockLane::with_items(Lane::Web, 2),
            MockLane::with_items(Lane::Vector, 2),
            MockLane::with_items(Lane::Kg, 2),
        );
        let out = orch
            .execute("query", &TraceId::new(), &CancellationToken::new())
            .await;
        assert_eq!(
            out.result_for(Lane::Vector).unwrap().status,
            LaneStatus::Disabled
        );
        assert!(out.warnings.iter().any(|w| w == "lane_disabled:vector"));
        assert!(out.warnings.iter().any(|w| w == "lane_disabled:kg"));
        assert!(out.any_items());
    }

    #[tokio::test]
    async fn test_failing_lane_is_recovered_locally() {
        let orch = orchestrator_with(
            fast_config(),
            MockLane::with_items(Lane::Web, 2).failing(),
            MockLane::with_items(Lane::Vector, 2),
            MockLane::with_items(Lane::Kg, 2),
        );
        let out = orch
            .execute("query", &TraceId::new(), &CancellationToken::new())
            .await;
        assert_eq!(out.result_for(Lane::Web).unwrap().status, LaneStatus::Error);
        assert!(out.warnings.iter().any(|w| w == "lane_error:web"));
        assert!(out.any_items());
    }

    #[tokio::test]
    async fn test_zero_enabled_lanes_is_valid() {
        let cfg = RetrievalConfig {
            enable_web: false,
            enable_vector: false,
            enable_kg: false,
            ..fast_config()
        };
        let orch = orchestrator_with(
            cfg,
            MockLane::new(Lane::Web),
            MockLane::new(Lane::Vector),
            MockLane::new(Lane::Kg),
        );
        let out = orch
            .execute("query", &TraceId::new(), &CancellationToken::new())
            .await;
        assert!(!out.any_items());
        assert_eq!(out.lane_results.len(), 3);
    }

    #[tokio::test]
    async fn test_repeated_lane_failures_open_lane_circuit() {
        let orch = orchestrator_with(
            fast_config(),
            MockLane::with_items(Lane::Web, 2).failing(),
            MockLane::with_items(Lane::Vector, 1),
            MockLane::with_items(Lane::Kg, 1),
        );
        let trace = TraceId::new();
        let cancel = CancellationToken::new();
        for _ in 0..3 {
            let _ = orch.execute("query", &trace, &cancel).await;
        }
        let out = orch.execute("query", &trace, &cancel).await;
        assert!(out.warnings.iter().any(|w| w == "lane_circuit_open:web"));
        let web = out.result_for(Lane::Web).unwrap();
        assert_eq!(web.error_kind.as_deref(), Some("circuit_open"));
    }

    #[tokio::test]
    async fn test_items_clamped_to_top_k() {
        let mut cfg = fast_config();
        cfg.web_top_k = 2;
        let orch = orchestrator_with(
            cfg,
            MockLane::with_items(Lane::Web, 10),
            MockLane::new(Lane::Vector),
            MockLane::new(Lane::Kg),
        );
        let out = orch
            .execute("query", &TraceId::new(), &CancellationToken::new())
            .await;
        assert!(out.result_for(Lane::Web).unwrap().items.len() <= 2);
    }
}
