use async_trait::async_trait;
use tracing::debug;

use prism_core::{PrismError, Result};

/// Trait for generating text embeddings.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate embeddings for a batch of texts.
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>>;

    /// The dimensionality of the output embeddings.
    fn dimensions(&self) -> usize;

    fn name(&self) -> &str;
}

/// OpenAI embeddings provider (text-embedding-3-small by default).
pub struct OpenAiEmbedding {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    dims: usize,
}

impl OpenAiEmbedding {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: "https://api.openai.com/v1".into(),
            model: "text-embedding-3-small".into(),
            dims: 1536,
        }
    }

    pub fn with_model(mut self, model: String, dims: usize) -> Self {
        self.model = model;
        self.dims = dims;
        self
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedding {
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        debug!(model = %self.model, count = texts.len(), "generating embeddings");

        let body = serde_json::json!({
            "model": &self.model,
            "input": texts,
        });

        let resp = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| PrismError::Provider {
                provider: "openai".into(),
                reason: format!("embedding request failed: {e}"),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(PrismError::Provider {
                provider: "openai".into(),
                reason: format!("embedding HTTP {status}: {text}"),
            });
        }

        let data: serde_json::Value = resp.json().await.map_err(|e| PrismError::Provider {
            provider: "openai".into(),
            reason: format!("embedding parse error: {e}"),
        })?;

        let embeddings: Vec<Vec<f32>> = data["data"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        item["embedding"].as_array().map(|arr| {
                            arr.iter()
                                .filter_map(|v| v.as_f64().map(|f| f as f32))
                                .collect()
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(embeddings)
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn name(&self) -> &str {
        "openai"
    }
}

/// Ollama embeddings provider (`/api/embeddings`).
pub struct OllamaEmbedding {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dims: usize,
}

impl OllamaEmbedding {
    pub fn new(base_url: String, model: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            dims: 768,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedding {
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());

        for text in texts {
            let body = serde_json::json!({
                "model": &self.model,
                "prompt": text,
            });

            let resp = self
                .client
                .post(format!("{}/api/embeddings", self.base_url))
                .json(&body)
                .send()
                .await
                .map_err(|e| PrismError::Provider {
                    provider: "ollama_local".into(),
                    reason: format!("ollama embedding: {e}"),
                })?;

            if !resp.status().is_success() {
                let text = resp.text().await.unwrap_or_default();
                return Err(PrismError::Provider {
                    provider: "ollama_local".into(),
                    reason: format!("ollama embedding error: {text}"),
                });
            }

            let data: serde_json::Value = resp.json().await.map_err(|e| PrismError::Provider {
                provider: "ollama_local".into(),
                reason: e.to_string(),
            })?;

            let embedding: Vec<f32> = data["embedding"]
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_f64().map(|f| f as f32))
                        .collect()
                })
                .unwrap_or_default();

            if !embedding.is_empty() {
                results.push(embedding);
            }
        }

        Ok(results)
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn name(&self) -> &str {
        "ollama"
    }
}

/// Deterministic local embedding built from token hashing. Used when no
/// embedding backend is configured, and by tests: same text, same vector,
/// no network.
pub struct HashingEmbedding {
    dims: usize,
}

impl HashingEmbedding {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }
}

impl Default for HashingEmbedding {
    fn default() -> Self {
        Self::new(384)
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedding {
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut v = vec![0.0f32; self.dims];
                for token in text.to_lowercase().split_whitespace() {
                    let mut h: u64 = 1469598103934665603;
                    for b in token.bytes() {
                        h ^= b as u64;
                        h = h.wrapping_mul(1099511628211);
                    }
                    let idx = (h % self.dims as u64) as usize;
                    let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
                    v[idx] += sign;
                }
                let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
                if norm > 0.0 {
                    for x in &mut v {
                        *x /= norm;
                    }
                }
                v
            })
            .collect())
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn name(&self) -> &str {
        "hashing"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hashing_embedding_is_deterministic() {
        let embedder = HashingEmbedding::default();
        let a = embedder.embed(&["quantum computing"]).await.unwrap();
        let b = embedder.embed(&["quantum computing"]).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 384);
    }

    #[tokio::test]
    async fn test_hashing_embedding_is_normalized() {
        let embedder = HashingEmbedding::default();
        let v = &embedder.embed(&["some query text"]).await.unwrap()[0];
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let embedder = HashingEmbedding::default();
        assert!(embedder.embed(&[]).await.unwrap().is_empty());
    }
}
