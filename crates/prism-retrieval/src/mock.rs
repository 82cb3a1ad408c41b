//! Mock retrieval lane for deterministic testing: scripted items, optional
//! artificial latency, optional failure.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use prism_core::{Lane, LaneRequest, LaneResult, Source};

use crate::lane::RetrievalLane;

pub struct MockLane {
    lane: Lane,
    items: Vec<Source>,
    delay: Duration,
    fail: bool,
    /// Queries received, for assertions in tests.
    pub requests: Arc<Mutex<Vec<String>>>,
}

impl MockLane {
    pub fn new(lane: Lane) -> Self {
        Self {
            lane,
            items: vec![],
            delay: Duration::ZERO,
            fail: false,
            requests: Arc::new(Mutex::new(vec![])),
        }
    }

    /// A lane that returns `count` scored items immediately.
    pub fn with_items(lane: Lane, count: usize) -> Self {
        let items = (0..count)
            .map(|i| {
                let mut s = Source::new(
                    format!("{}-{i}", lane.as_str()),
                    format!("{} result {i}", lane.as_str()),
                    lane,
                );
                s.url = Some(format!("https://example.com/{}/{i}", lane.as_str()));
                s.snippet = format!("snippet for {} result {i}", lane.as_str());
                s.score = 1.0 / (1.0 + i as f64);
                s
            })
            .collect();
        Self {
            lane,
            items,
            delay: Duration::ZERO,
            fail: false,
            requests: Arc::new(Mutex::new(vec![])),
        }
    }

    pub fn with_sources(mut self, items: Vec<Source>) -> Self {
        self.items = items;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }
}

#[async_trait]
impl RetrievalLane for MockLane {
    fn lane(&self) -> Lane {
        self.lane
    }

    async fn search(&self, request: &LaneRequest) -> LaneResult {
        self.requests
            .lock()
            .unwrap()
            .push(request.query_text.clone());
        let started = Instant::now();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let latency_ms = started.elapsed().as_millis() as u64;
        if self.fail {
            return LaneResult::error(self.lane, latency_ms, "lane_error");
        }
        let items: Vec<Source> = self.items.iter().take(request.top_k).cloned().collect();
        LaneResult::ok(self.lane, items, latency_ms)
    }
}
