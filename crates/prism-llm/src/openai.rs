use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use prism_core::{PrismError, Result};

use crate::provider::*;

/// OpenAI chat-completions provider. Also backs any OpenAI-compatible
/// endpoint (the remote GPU tier) via [`OpenAiProvider::openai_compatible`].
pub struct OpenAiProvider {
    client: Client,
    id: String,
    api_key: Option<String>,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            id: "openai".into(),
            api_key: Some(api_key),
            base_url: "https://api.openai.com/v1".into(),
        }
    }

    /// An OpenAI-compatible server under a different provider id, optionally
    /// keyless (self-hosted inference).
    pub fn openai_compatible(id: &str, base_url: String, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            id: id.to_string(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn build_body(&self, request: &CompletionRequest, stream: bool) -> serde_json::Value {
        let mut messages = Vec::new();
        if let Some(ref system) = request.system {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        messages.push(serde_json::json!({"role": "user", "content": request.prompt}));
        serde_json::json!({
            "model": &request.model,
            "messages": messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "stream": stream,
        })
    }

    fn request_builder(&self, url: String) -> reqwest::RequestBuilder {
        let mut builder = self.client.post(url).header("content-type", "application/json");
        if let Some(ref key) = self.api_key {
            builder = builder.header("authorization", format!("Bearer {key}"));
        }
        builder
    }

    fn provider_err(&self, reason: impl Into<String>) -> PrismError {
        PrismError::Provider {
            provider: self.id.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        debug!(provider = %self.id, model = %request.model, "sending chat completion request");
        let resp = self
            .request_builder(format!("{}/chat/completions", self.base_url))
            .json(&self.build_body(request, false))
            .send()
            .await
            .map_err(|e| self.provider_err(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(self.provider_err(format!("HTTP {status}: {text}")));
        }

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| self.provider_err(e.to_string()))?;

        let text = data["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        Ok(CompletionResponse {
            text,
            usage: TokenUsage {
                input_tokens: data["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
                output_tokens: data["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
                estimated_cost_usd: 0.0,
            },
        })
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
    ) -> Result<tokio::sync::mpsc::Receiver<StreamChunk>> {
        let (tx, rx) = tokio::sync::mpsc::channel(256);
        let builder = self
            .request_builder(format!("{}/chat/completions", self.base_url))
            .json(&self.build_body(request, true));

        tokio::spawn(async move {
            let resp = builder.send().await;
            match resp {
                Ok(resp) if resp.status().is_success() => {
                    use futures::StreamExt;
                    let mut stream = resp.bytes_stream();
                    let mut buffer = String::new();
                    let mut output_tokens = 0u32;

                    while let Some(chunk_result) = stream.next().await {
                        match chunk_result {
                            Ok(bytes) => {
                                buffer.push_str(&String::from_utf8_lossy(&bytes));
                                while let Some(newline_pos) = buffer.find('\n') {
                                    let line = buffer[..newline_pos].trim().to_string();
                                    buffer = buffer[newline_pos + 1..].to_string();

                                    let Some(data) = line.strip_prefix("data: ") else {
                                        continue;
                                    };
                                    if data == "[DONE]" {
                                        let _ = tx
                                            .send(StreamChunk::Usage(TokenUsage {
                                                input_tokens: 0,
                                                output_tokens,
                                                estimated_cost_usd: 0.0,
                                            }))
                                            .await;
                                        let _ = tx.send(StreamChunk::Done).await;
                                        return;
                                    }
                                    let Ok(event) =
                                        serde_json::from_str::<serde_json::Value>(data)
                                    else {
                                        continue;
                                    };
                                    if let Some(text) =
                                        event["choices"][0]["delta"]["content"].as_str()
                                        && !text.is_empty()
                                    {
                                        output_tokens += approx_tokens(text);
                                        let _ = tx
                                            .send(StreamChunk::TextDelta(text.to_string()))
                                            .await;
                                    }
                                }
                            }
                            Err(e) => {
                                let _ = tx.send(StreamChunk::Error(e.to_string())).await;
                                return;
                            }
                        }
                    }
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
        if self.id == "openai" && self.api_key.is_none() {
            return Err(self.provider_err("OPENAI_API_KEY not set"));
        }
        Ok(())
    }
}
