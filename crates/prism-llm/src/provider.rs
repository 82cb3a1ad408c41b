use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use prism_core::Result;

/// A synthesis request handed to one provider adapter. The router owns model
/// selection; by the time an adapter sees this, `model` is fixed.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    /// System instruction, separate from the prompt for providers that
    /// support it natively.
    pub system: Option<String>,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// A complete (non-streaming) response.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub text: String,
    pub usage: TokenUsage,
}

/// Token usage for one call. Cost is filled in by the router from the
/// catalog; adapters report raw token counts.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub estimated_cost_usd: f64,
}

impl TokenUsage {
    pub fn total_tokens(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// A chunk of a streaming response.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    /// Incremental answer text.
    TextDelta(String),
    /// Usage stats, sent once near the end of the stream.
    Usage(TokenUsage),
    /// Stream finished cleanly.
    Done,
    /// The provider failed mid-stream.
    Error(String),
}

/// Trait implemented by each LLM provider adapter.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Catalog provider id, e.g. "ollama_local", "anthropic", "local_stub".
    fn id(&self) -> &str;

    /// Send a non-streaming request.
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse>;

    /// Send a streaming request. Returns a receiver for chunks; the sender
    /// side lives on a spawned task and closes the channel when done.
    async fn stream(
        &self,
        request: &CompletionRequest,
    ) -> Result<tokio::sync::mpsc::Receiver<StreamChunk>>;

    /// Check whether this provider is configured and reachable.
    async fn health_check(&self) -> Result<()>;
}

/// Rough token estimate for budget checks; ~4 chars per token.
pub fn approx_tokens(text: &str) -> u32 {
    (text.len() as u32).div_ceil(4)
}
