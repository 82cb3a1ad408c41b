use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use prism_core::{PrismError, Result};

use crate::provider::*;

/// Anthropic Claude API provider, paid tier.
pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: "https://api.anthropic.com/v1".into(),
        }
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    fn build_body(&self, request: &CompletionRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": &request.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": [{"role": "user", "content": request.prompt}],
            "stream": stream,
        });
        if let Some(ref system) = request.system {
            body["system"] = serde_json::json!(system);
        }
        body
    }

    fn provider_err(reason: impl Into<String>) -> PrismError {
        PrismError::Provider {
            provider: "anthropic".into(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn id(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        debug!(model = %request.model, "sending anthropic request");
        let resp = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&self.build_body(request, false))
            .send()
            .await
            .map_err(|e| Self::provider_err(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            if status.as_u16() == 429 {
                return Err(PrismError::RateLimited {
                    retry_after_secs: 30,
                });
            }
            return Err(Self::provider_err(format!("HTTP {status}: {text}")));
        }

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| Self::provider_err(e.to_string()))?;

        let text = data["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| {
                        if b["type"] == "text" {
                            b["text"].as_str().map(|s| s.to_string())
                        } else {
                            None
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        Ok(CompletionResponse {
            text,
            usage: TokenUsage {
                input_tokens: data["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
                output_tokens: data["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
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
        let base_url = self.base_url.clone();
        let api_key = self.api_key.clone();

        tokio::spawn(async move {
            let resp = client
                .post(format!("{base_url}/messages"))
                .header("x-api-key", &api_key)
                .header("anthropic-version", "2023-06-01")
                .header("content-type", "application/json")
                .json(&body)
                .send()
                .await;

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

                                    if line.is_empty() || line.starts_with(':') {
                                        continue;
                                    }
                                    let Some(data) = line.strip_prefix("data: ") else {
                                        continue;
                                    };
                                    let Ok(event) =
                                        serde_json::from_str::<serde_json::Value>(data)
                                    else {
                                        continue;
                                    };

                                    match event["type"].as_str() {
                                        Some("message_start") => {
                                            if let Some(it) = event["message"]["usage"]
                                                ["input_tokens"]
                                                .as_u64()
                                            {
                                                input_tokens = it as u32;
                                            }
                                        }
                                        Some("content_block_delta") => {
                                            if event["delta"]["type"].as_str()
                                                == Some("text_delta")
                                                && let Some(text) =
                                                    event["delta"]["text"].as_str()
                                            {
                                                let _ = tx
                                                    .send(StreamChunk::TextDelta(
                                                        text.to_string(),
                                                    ))
                                                    .await;
                                            }
                                        }
                                        Some("message_delta") => {
                                            if let Some(ot) =
                                                event["usage"]["output_tokens"].as_u64()
                                            {
                                                output_tokens = ot as u32;
                                            }
                                        }
                                        Some("message_stop") => {
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
                                        Some("error") => {
                                            let msg = event["error"]["message"]
                                                .as_str()
                                                .unwrap_or("unknown error");
                                            let _ = tx
                                                .send(StreamChunk::Error(msg.to_string()))
                                                .await;
                                            return;
                                        }
                                        _ => {}
                                    }
                                }
                            }
                            Err(e) => {
                                let _ = tx.send(StreamChunk::Error(e.to_string())).await;
                                return;
                            }
                        }
                    }
                    // Stream ended without message_stop.
                    let _ = tx.send(StreamChunk::Done).await;
                }
                Ok(resp) => {
                    let text = resp.text().await.unwrap_or_default();
                    let _ = tx.send(StreamChunk::Error(text)).await;
                }
                Err(e) => {
                    let _ = tx.send(StreamChunk::Error(e.to_string())).await;
                }
            }
        });

        Ok(rx)
    }

    async fn health_check(&self) -> Result<()> {
        if self.api_key.is_empty() {
            return Err(Self::provider_err("ANTHROPIC_API_KEY not set"));
        }
        Ok(())
    }
}
