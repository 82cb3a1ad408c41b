//! Vector lane: embeds the query (cached by hash) and runs an
//! approximate-nearest-neighbor search against a qdrant-compatible store.

use async_trait::async_trait;
use dashmap::DashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

use prism_config::schema::RetrievalConfig;
use prism_core::{Lane, LaneRequest, LaneResult, Source};

use crate::embedding::EmbeddingProvider;
use crate::lane::RetrievalLane;

/// Shared hit/miss counters for the embedding cache, read by the metrics
/// endpoint.
#[derive(Debug, Default)]
pub struct CacheCounters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
}

pub struct VectorLane {
    client: reqwest::Client,
    base_url: Option<String>,
    api_key: Option<String>,
    collection: String,
    embedder: Arc<dyn EmbeddingProvider>,
    cache: DashMap<u64, Arc<Vec<f32>>>,
    counters: Arc<CacheCounters>,
}

impl VectorLane {
    pub fn new(
        cfg: &RetrievalConfig,
        embedder: Arc<dyn EmbeddingProvider>,
        counters: Arc<CacheCounters>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: cfg
                .vector_db_url
                .as_ref()
                .map(|u| u.trim_end_matches('/').to_string()),
            api_key: cfg.vector_db_api_key.clone(),
            collection: cfg.vector_collection.clone(),
            embedder,
            cache: DashMap::new(),
            counters,
        }
    }

    /// Embed the query, consulting the hash cache first.
    async fn query_embedding(&self, text: &str) -> Result<Arc<Vec<f32>>, String> {
        let key = text_hash(text);
        if let Some(hit) = self.cache.get(&key) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(&hit));
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        let mut vectors = self
            .embedder
            .embed(&[text])
            .await
            .map_err(|e| e.to_string())?;
        if vectors.is_empty() {
            return Err("embedder returned no vector".into());
        }
        let vector = Arc::new(vectors.remove(0));
        self.cache.insert(key, Arc::clone(&vector));
        Ok(vector)
    }

    async fn ann_search(
        &self,
        vector: &[f32],
        request: &LaneRequest,
    ) -> Result<Vec<Source>, String> {
        let base = self.base_url.as_ref().ok_or("no vector db url")?;
        let mut builder = self
            .client
            .post(format!(
                "{base}/collections/{}/points/search",
                self.collection
            ))
            .json(&serde_json::json!({
                "vector": vector,
                "limit": request.top_k,
                "with_payload": true,
            }))
            .timeout(Duration::from_millis(request.deadline_ms));
        if let Some(ref key) = self.api_key {
            builder = builder.header("api-key", key);
        }

        let resp = builder.send().await.map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("HTTP {}", resp.status()));
        }
        let data: serde_json::Value = resp.json().await.map_err(|e| e.to_string())?;

        let points = data["result"].as_array().cloned().unwrap_or_default();
        Ok(points
            .iter()
            .take(request.top_k)
            .enumerate()
            .map(|(i, point)| {
                let payload = &point["payload"];
                let title = payload["title"].as_str().unwrap_or("untitled").to_string();
                let mut source = Source::new(format!("vec-{i}"), title, Lane::Vector);
                source.url = payload["url"].as_str().map(|s| s.to_string());
                source.snippet = payload["text"]
                    .as_str()
                    .or_else(|| payload["snippet"].as_str())
                    .unwrap_or_default()
                    .chars()
                    .take(1024)
                    .collect();
                // Cosine similarity from the store, clamped to [0, 1].
                source.score = point["score"].as_f64().unwrap_or(0.0).clamp(0.0, 1.0);
                source
            })
            .collect())
    }
}

fn text_hash(text: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

#[async_trait]
impl RetrievalLane for VectorLane {
    fn lane(&self) -> Lane {
        Lane::Vector
    }

    async fn search(&self, request: &LaneRequest) -> LaneResult {
        let started = Instant::now();
        debug!(trace_id = %request.trace_id, "vector lane start");

        let vector = match self.query_embedding(&request.query_text).await {
            Ok(v) => v,
            Err(reason) => {
                debug!(trace_id = %request.trace_id, reason = %reason, "embedding failed");
                return LaneResult::error(
                    Lane::Vector,
                    started.elapsed().as_millis() as u64,
                    "lane_error",
                );
            }
        };

        let outcome = self.ann_search(&vector, request).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(items) => LaneResult::ok(Lane::Vector, items, latency_ms),
            Err(reason) => {
                debug!(trace_id = %request.trace_id, reason = %reason, "vector lane error");
                LaneResult::error(Lane::Vector, latency_ms, "lane_error")
            }
        }
    }
}
