use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use prism_core::{PrismError, Result};

use crate::provider::*;

/// HuggingFace Inference API, free-remote tier. The serverless API does not
/// stream, so `stream` runs the call and re-chunks the text.
pub struct HuggingFaceProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl HuggingFaceProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: "https://api-inference.huggingface.co/models".into(),
        }
    }

    fn provider_err(reason: impl Into<String>) -> PrismError {
        PrismError::Provider {
            provider: "huggingface".into(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl LlmProvider for HuggingFaceProvider {
    fn id(&self) -> &str {
        "huggingface"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        debug!(model = %request.model, "sending huggingface request");
        let input = match &request.system {
            Some(system) => format!("{system}\n\n{}", request.prompt),
            None => request.prompt.clone(),
        };
        let body = serde_json::json!({
            "inputs": input,
            "parameters": {
                "max_new_tokens": request.max_tokens,
                "temperature": request.temperature.max(0.01),
                "return_full_text": false,
            },
        });

        let resp = self
            .client
            .post(format!("{}/{}", self.base_url, request.model))
            .header("authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::provider_err(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(Self::provider_err(format!("HTTP {status}: {text}")));
        }

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| Self::provider_err(e.to_string()))?;

        let text = data[0]["generated_text"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        if text.is_empty() {
            return Err(Self::provider_err("empty generation"));
        }

        let usage = TokenUsage {
            input_tokens: approx_tokens(&input),
            output_tokens: approx_tokens(&text),
            estimated_cost_usd: 0.0,
        };
        Ok(CompletionResponse { text, usage })
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
    ) -> Result<tokio::sync::mpsc::Receiver<StreamChunk>> {
        let response = self.complete(request).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        tokio::spawn(async move {
            for word in response.text.split_inclusive(' ') {
                if tx
                    .send(StreamChunk::TextDelta(word.to_string()))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            let _ = tx.send(StreamChunk::Usage(response.usage)).await;
            let _ = tx.send(StreamChunk::Done).await;
        });
        Ok(rx)
    }

    async fn health_check(&self) -> Result<()> {
        if self.api_key.is_empty() {
            return Err(Self::provider_err("HUGGINGFACE_API_KEY not set"));
        }
        Ok(())
    }
}
