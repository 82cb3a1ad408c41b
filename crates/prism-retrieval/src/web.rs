//! Web lane: queries an external search API (Brave-compatible), with an
//! optional Meilisearch index as a keyless local fallback.

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::debug;

use prism_config::schema::RetrievalConfig;
use prism_core::{Lane, LaneRequest, LaneResult, Source};

use crate::lane::RetrievalLane;

pub struct WebLane {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    meilisearch_url: Option<String>,
    meilisearch_key: Option<String>,
}

impl WebLane {
    pub fn from_config(cfg: &RetrievalConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: cfg.search_provider_url.clone(),
            api_key: cfg.search_api_key.clone(),
            meilisearch_url: cfg.meilisearch_url.clone(),
            meilisearch_key: cfg.meilisearch_master_key.clone(),
        }
    }

    async fn search_provider(&self, request: &LaneRequest) -> Result<Vec<Source>, String> {
        let api_key = self.api_key.as_ref().ok_or("no search api key")?;
        let resp = self
            .client
            .get(&self.endpoint)
            .header("x-subscription-token", api_key)
            .query(&[
                ("q", request.query_text.as_str()),
                ("count", &request.top_k.to_string()),
            ])
            .timeout(Duration::from_millis(request.deadline_ms))
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !resp.status().is_success() {
            return Err(format!("HTTP {}", resp.status()));
        }
        let data: serde_json::Value = resp.json().await.map_err(|e| e.to_string())?;

        let hits = data["web"]["results"].as_array().cloned().unwrap_or_default();
        Ok(hits
            .iter()
            .take(request.top_k)
            .enumerate()
            .map(|(i, hit)| {
                let mut source = Source::new(format!("web-{i}"), hit_str(hit, "title"), Lane::Web);
                source.url = hit["url"].as_str().map(|s| s.to_string());
                source.snippet = truncate(&hit_str(hit, "description"), 1024);
                // Rank decay: the provider's ordering is the signal.
                source.score = 1.0 / (1.0 + i as f64);
                source
            })
            .collect())
    }

    async fn search_meilisearch(&self, request: &LaneRequest) -> Result<Vec<Source>, String> {
        let base = self.meilisearch_url.as_ref().ok_or("no meilisearch url")?;
        let mut builder = self
            .client
            .post(format!("{}/indexes/pages/search", base.trim_end_matches('/')))
            .json(&serde_json::json!({
                "q": request.query_text,
                "limit": request.top_k,
            }))
            .timeout(Duration::from_millis(request.deadline_ms));
        if let Some(ref key) = self.meilisearch_key {
            builder = builder.header("authorization", format!("Bearer {key}"));
        }

        let resp = builder.send().await.map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("HTTP {}", resp.status()));
        }
        let data: serde_json::Value = resp.json().await.map_err(|e| e.to_string())?;
        let hits = data["hits"].as_array().cloned().unwrap_or_default();
        Ok(hits
            .iter()
            .take(request.top_k)
            .enumerate()
            .map(|(i, hit)| {
                let mut source = Source::new(format!("web-{i}"), hit_str(hit, "title"), Lane::Web);
                source.url = hit["url"].as_str().map(|s| s.to_string());
                source.snippet = truncate(&hit_str(hit, "content"), 1024);
                source.score = 1.0 / (1.0 + i as f64);
                source
            })
            .collect())
    }
}

fn hit_str(value: &serde_json::Value, key: &str) -> String {
    value[key].as_str().unwrap_or_default().to_string()
}

fn truncate(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[async_trait]
impl RetrievalLane for WebLane {
    fn lane(&self) -> Lane {
        Lane::Web
    }

    async fn search(&self, request: &LaneRequest) -> LaneResult {
        let started = Instant::now();
        debug!(trace_id = %request.trace_id, query = %request.query_text, "web lane start");

        let outcome = if self.api_key.is_some() {
            self.search_provider(request).await
        } else {
            self.search_meilisearch(request).await
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        match outcome {
            // Empty result set is a valid, successful outcome.
            Ok(items) => LaneResult::ok(Lane::Web, items, latency_ms),
            Err(reason) => {
                debug!(trace_id = %request.trace_id, reason = %reason, "web lane error");
                LaneResult::error(Lane::Web, latency_ms, "lane_error")
            }
        }
    }
}
