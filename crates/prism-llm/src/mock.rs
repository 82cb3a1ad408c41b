//! Mock LLM provider for deterministic testing.
//!
//! Returns pre-configured responses without making any HTTP calls. Registers
//! under any provider id so tests can stand in for a real backend.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use prism_core::{PrismError, Result};

use crate::provider::*;

/// A pre-configured response from the mock provider.
#[derive(Clone)]
pub struct MockCompletion {
    pub text: String,
    pub usage: TokenUsage,
    /// If set, the provider returns this error instead.
    pub error: Option<String>,
    /// Artificial latency before responding.
    pub delay: Duration,
}

impl Default for MockCompletion {
    fn default() -> Self {
        Self {
            text: String::new(),
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
                estimated_cost_usd: 0.0,
            },
            error: None,
            delay: Duration::ZERO,
        }
    }
}

/// A mock provider with a queue of scripted responses and a record of every
/// request it received.
pub struct MockProvider {
    responses: Arc<Mutex<Vec<MockCompletion>>>,
    /// All requests received, for assertions in tests.
    pub requests: Arc<Mutex<Vec<CompletionRequest>>>,
    id: String,
}

impl MockProvider {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(vec![])),
            requests: Arc::new(Mutex::new(vec![])),
            id: id.into(),
        }
    }

    /// Queue a simple text response.
    pub fn with_response(self, text: &str) -> Self {
        self.responses.lock().unwrap().push(MockCompletion {
            text: text.to_string(),
            ..Default::default()
        });
        self
    }

    /// Queue an error response.
    pub fn with_error(self, error: &str) -> Self {
        self.responses.lock().unwrap().push(MockCompletion {
            error: Some(error.to_string()),
            ..Default::default()
        });
        self
    }

    /// Queue a response that takes `delay` to arrive.
    pub fn with_slow_response(self, text: &str, delay: Duration) -> Self {
        self.responses.lock().unwrap().push(MockCompletion {
            text: text.to_string(),
            delay,
            ..Default::default()
        });
        self
    }

    /// Queue a fully custom response.
    pub fn with_completion(self, completion: MockCompletion) -> Self {
        self.responses.lock().unwrap().push(completion);
        self
    }

    pub fn recorded_requests(&self) -> Arc<Mutex<Vec<CompletionRequest>>> {
        Arc::clone(&self.requests)
    }

    /// Pop the next queued response, or a default when the queue is empty.
    fn next_response(&self) -> MockCompletion {
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            MockCompletion {
                text: "(mock: no more queued responses)".to_string(),
                ..Default::default()
            }
        } else {
            responses.remove(0)
        }
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        self.requests.lock().unwrap().push(request.clone());
        let mock = self.next_response();

        if !mock.delay.is_zero() {
            tokio::time::sleep(mock.delay).await;
        }
        if let Some(error) = mock.error {
            return Err(PrismError::Provider {
                provider: self.id.clone(),
                reason: error,
            });
        }

        Ok(CompletionResponse {
            text: mock.text,
            usage: mock.usage,
        })
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<mpsc::Receiver<StreamChunk>> {
        self.requests.lock().unwrap().push(request.clone());
        let mock = self.next_response();

        if !mock.delay.is_zero() {
            tokio::time::sleep(mock.delay).await;
        }
        if let Some(error) = mock.error {
            return Err(PrismError::Provider {
                provider: self.id.clone(),
                reason: error,
            });
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            for word in mock.text.split_inclusive(' ') {
                if tx
                    .send(StreamChunk::TextDelta(word.to_string()))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            let _ = tx.send(StreamChunk::Usage(mock.usage)).await;
            let _ = tx.send(StreamChunk::Done).await;
        });
        Ok(rx)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CompletionRequest {
        CompletionRequest {
            model: "test".into(),
            system: None,
            prompt: "hello".into(),
            max_tokens: 100,
            temperature: 0.7,
        }
    }

    #[tokio::test]
    async fn test_mock_text_response() {
        let provider = MockProvider::new("mock").with_response("Hello!");
        let resp = provider.complete(&request()).await.unwrap();
        assert_eq!(resp.text, "Hello!");
    }

    #[tokio::test]
    async fn test_mock_error() {
        let provider = MockProvider::new("mock").with_error("HTTP 429: rate limited");
        assert!(provider.complete(&request()).await.is_err());
    }

    #[tokio::test]
    async fn test_mock_records_requests() {
        let provider = MockProvider::new("mock").with_response("ok");
        let mut req = request();
        req.system = Some("be terse".into());
        let _ = provider.complete(&req).await;
        let recorded = provider.recorded_requests();
        let recorded = recorded.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].system.as_deref(), Some("be terse"));
    }

    #[tokio::test]
    async fn test_mock_responses_in_order() {
        let provider = MockProvider::new("mock")
            .with_response("first")
            .with_response("second");
        assert_eq!(provider.complete(&request()).await.unwrap().text, "first");
        assert_eq!(provider.complete(&request()).await.unwrap().text, "second");
    }

    #[tokio::test]
    async fn test_mock_streaming_roundtrip() {
        let provider = MockProvider::new("mock").with_response("one two three");
        let mut rx = provider.stream(&request()).await.unwrap();
        let mut text = String::new();
        let mut saw_done = false;
        while let Some(chunk) = rx.recv().await {
            match chunk {
                StreamChunk::TextDelta(t) => text.push_str(&t),
                StreamChunk::Done => saw_done = true,
                _ => {}
            }
        }
        assert_eq!(text, "one two three");
        assert!(saw_done);
    }
}
