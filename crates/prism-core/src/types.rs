use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::trace::TraceId;

/// An independent retrieval source invoked in parallel by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Web,
    Vector,
    Kg,
}

impl Lane {
    /// Fixed iteration order used everywhere results are merged or rendered,
    /// so identical inputs produce identical output.
    pub const ALL: [Lane; 3] = [Lane::Web, Lane::Vector, Lane::Kg];

    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Web => "web",
            Lane::Vector => "vector",
            Lane::Kg => "kg",
        }
    }

    /// Position in the fixed lane order, used as a deterministic tie-breaker.
    pub fn order(&self) -> usize {
        match self {
            Lane::Web => 0,
            Lane::Vector => 1,
            Lane::Kg => 2,
        }
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome category of a single lane call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaneStatus {
    Ok,
    Timeout,
    Error,
    Disabled,
}

/// One retrieved item: title, optional URL, snippet, and the lane it came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    /// Stable within a single request.
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub snippet: String,
    /// Normalized relevance in [0, 1].
    pub score: f64,
    pub origin_lane: Lane,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl Source {
    pub fn new(id: impl Into<String>, title: impl Into<String>, lane: Lane) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            url: None,
            snippet: String::new(),
            score: 0.0,
            origin_lane: lane,
            metadata: HashMap::new(),
        }
    }
}

/// The request one lane adapter receives from the orchestrator.
#[derive(Debug, Clone)]
pub struct LaneRequest {
    pub query_text: String,
    pub top_k: usize,
    pub deadline_ms: u64,
    pub trace_id: TraceId,
}

/// What one lane call produced. Lanes never propagate errors past this
/// boundary; faults become `status = Timeout | Error` with empty items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaneResult {
    pub lane: Lane,
    pub status: LaneStatus,
    pub items: Vec<Source>,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

impl LaneResult {
    pub fn ok(lane: Lane, items: Vec<Source>, latency_ms: u64) -> Self {
        Self {
            lane,
            status: LaneStatus::Ok,
            items,
            latency_ms,
            error_kind: None,
        }
    }

    pub fn timeout(lane: Lane, latency_ms: u64) -> Self {
        Self {
            lane,
            status: LaneStatus::Timeout,
            items: vec![],
            latency_ms,
            error_kind: Some("lane_timeout".into()),
        }
    }

    pub fn error(lane: Lane, latency_ms: u64, kind: impl Into<String>) -> Self {
        Self {
            lane,
            status: LaneStatus::Error,
            items: vec![],
            latency_ms,
            error_kind: Some(kind.into()),
        }
    }

    pub fn disabled(lane: Lane) -> Self {
        Self {
            lane,
            status: LaneStatus::Disabled,
            items: vec![],
            latency_ms: 0,
            error_kind: None,
        }
    }
}

/// How the guided-prompt stage treats a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuidedPromptMode {
    #[default]
    On,
    Off,
    BypassOnce,
    AlwaysBypass,
}

/// A single inbound query, immutable once constructed.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub query_text: String,
    pub trace_id: TraceId,
    pub user_id: Option<String>,
    pub guided_prompt_mode: GuidedPromptMode,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lane_order_is_fixed() {
        assert_eq!(Lane::ALL.map(|l| l.order()), [0, 1, 2]);
        assert_eq!(Lane::Web.as_str(), "web");
        assert_eq!(Lane::Kg.as_str(), "kg");
    }

    #[test]
    fn test_lane_serde_snake_case() {
        assert_eq!(serde_json::to_string(&Lane::Vector).unwrap(), "\"vector\"");
        let mode: GuidedPromptMode = serde_json::from_str("\"bypass_once\"").unwrap();
        assert_eq!(mode, GuidedPromptMode::BypassOnce);
    }

    #[test]
    fn test_lane_result_constructors() {
        let r = LaneResult::timeout(Lane::Vector, 2100);
        assert_eq!(r.status, LaneStatus::Timeout);
        assert!(r.items.is_empty());
        assert_eq!(r.error_kind.as_deref(), Some("lane_timeout"));

        let r = LaneResult::disabled(Lane::Kg);
        assert_eq!(r.status, LaneStatus::Disabled);
        assert_eq!(r.latency_ms, 0);
    }
}
