use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use prism_core::{PrismError, Result};

use crate::provider::*;

/// Local Ollama daemon, free tier. Streaming uses the NDJSON `/api/generate`
/// protocol: one JSON object per line, `done: true` on the last.
pub struct OllamaProvider {
    client: Client,
    base_url: String,
}

impl OllamaProvider {
    pub fn new(base_url: String) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn build_body(&self, request: &CompletionRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": &request.model,
            "prompt": &request.prompt,
            "stream": stream,
            "options": {
                "temperature": request.temperature,
                "num_predict": request.max_tokens,
            },
        });
        if let Some(ref system) = request.system {
            body["system"] = serde_json::json!(system);
        }
        body
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn id(&self) -> &str {
        "ollama_local"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        debug!(model = %request.model, "sending ollama request");
        let resp = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&self.build_body(request, false))
            .send()
            .await
            .map_err(|e| PrismError::Provider {
                provider: "ollama_local".into(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(PrismError::Provider {
                provider: "ollama_local".into(),
                reason: format!("HTTP {status}: {text}"),
            });
        }

        let data: serde_json::Value = resp.json().await.map_err(|e| PrismError::Provider {
            provider: "ollama_local".into(),
            reason: e.to_string(),
        })?;

        Ok(CompletionResponse {
            text: data["response"].as_str().unwrap_or_default().to_string(),
            usage: TokenUsage {
                input_tokens: data["prompt_eval_count"].as_u64().unwrap_or(0) as u32,
                output_tokens: data["eval_count"].as_u64().unwrap_or(0) as u32,
                estimated_cost_usd: 0.0,
            },
        })
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
    ) -> Result<tokio::sync::mpsc::Receiver<StreamChunk>> {
        let (tx, rx) = tokio::sync::mpsc::channel(256);
        let body = self.build_body(request, true);
        let client = self.client.clone();
        let url = format!("{}/api/generate", self.base_url);

        tokio::spawn(async move {
            let resp = client.post(&url).json(&body).send().await;
            match resp {
                Ok(resp) if resp.status().is_success() => {
                    use futures::StreamExt;
                    let mut stream = resp.bytes_stream();
                    let mut buffer = String::new();
                    let mut input_tokens = 0u32;
                    let mut output_tokens = 0u32;

                    while let Some(chunk_result) = stream.next().await {
                        match chunk_result {
                            Ok(bytes) => {
                                buffer.push_str(&String::from_utf8_lossy(&bytes));
                                while let Some(newline_pos) = buffer.find('\n') {
                                    let line = buffer[..newline_pos].trim().to_string();
                                    buffer = buffer[newline_pos + 1..].to_string();
                                    if line.is_empty() {
                                        continue;
                                    }
                                    let Ok(event) =
                                        serde_json::from_str::<serde_json::Value>(&line)
                                    else {
                                        continue;
                                    };

                                    if let Some(text) = event["response"].as_str()
                                        && !text.is_empty()
                                    {
                                        let _ = tx
                                            .send(StreamChunk::TextDelta(text.to_string()))
                                            .await;
                                    }
                                    if event["done"].as_bool() == Some(true) {
                                        input_tokens =
                                            event["prompt_eval_count"].as_u64().unwrap_or(0) as u32;
                                        output_tokens =
                                            event["eval_count"].as_u64().unwrap_or(0) as u32;
                                        let _ = tx
                                            .send(StreamChunk::Usage(TokenUsage {
                                                input_tokens,
                                                output_tokens,
                                                estimated_cost_usd: 0.0,
                                            }))
                                            .await;
                                        let _ = tx.send(StreamChunk::Done).await;
                                        return;
                                    }
                                }
                            }
                            Err(e) => {
                                let _ = tx.send(StreamChunk::Error(e.to_string())).await;
                                return;
                            }
                        }
                    }
                    // Stream ended without a done marker.
                    let _ = tx
                        .send(StreamChunk::Usage(TokenUsage {
                            input_tokens,
                            output_tokens,
                            estimated_cost_usd: 0.0,
                        }))
                        .await;
                    let _ = tx.send(StreamChunk::Done).await;
                }
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    let _ = tx
                        .send(StreamChunk::Error(format!("HTTP {status}: {text}")))
                        .await;
                }
                Err(e) => {
                    let _ = tx.send(StreamChunk::Error(e.to_string())).await;
                }
            }
        });

        Ok(rx)
    }

    async fn health_check(&self) -> Result<()> {
        let resp = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
            .map_err(|e| PrismError::Provider {
                provider: "ollama_local".into(),
                reason: format!("unreachable: {e}"),
            })?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(PrismError::Provider {
                provider: "ollama_local".into(),
                reason: format!("HTTP {}", resp.status()),
            })
        }
    }
}
