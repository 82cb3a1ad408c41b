use async_trait::async_trait;

use prism_core::Result;

use crate::provider::*;

/// The answer returned when no real provider is reachable.
const STUB_ANSWER: &str = "I could not reach a language model to synthesize an answer right now. \
The retrieved sources below may still be useful; please retry shortly.";

/// Terminal fallback provider. Always available, always succeeds, costs
/// nothing. Lives at the end of every failover chain so a request can
/// always produce an answer.
pub struct StubProvider {
    id: String,
}

impl StubProvider {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[async_trait]
impl LlmProvider for StubProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        Ok(CompletionResponse {
            text: STUB_ANSWER.to_string(),
            usage: TokenUsage {
                input_tokens: approx_tokens(&request.prompt),
                output_tokens: approx_tokens(STUB_ANSWER),
                estimated_cost_usd: 0.0,
            },
        })
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
    ) -> Result<tokio::sync::mpsc::Receiver<StreamChunk>> {
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let usage = TokenUsage {
            input_tokens: approx_tokens(&request.prompt),
            output_tokens: approx_tokens(STUB_ANSWER),
            estimated_cost_usd: 0.0,
        };
        tokio::spawn(async move {
            for word in STUB_ANSWER.split_inclusive(' ') {
                if tx
                    .send(StreamChunk::TextDelta(word.to_string()))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            let _ = tx.send(StreamChunk::Usage(usage)).await;
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
            model: "stub-small".into(),
            system: None,
            prompt: "anything".into(),
            max_tokens: 64,
            temperature: 0.0,
        }
    }

    #[tokio::test]
    async fn test_stub_always_answers() {
        let stub = StubProvider::new("local_stub");
        let resp = stub.complete(&request()).await.unwrap();
        assert!(!resp.text.is_empty());
        assert_eq!(resp.usage.estimated_cost_usd, 0.0);
    }

    #[tokio::test]
    async fn test_stub_stream_terminates_with_done() {
        let stub = StubProvider::new("local_stub");
        let mut rx = stub.stream(&request()).await.unwrap();
        let mut text = String::new();
        let mut done = false;
        while let Some(chunk) = rx.recv().await {
            match chunk {
                StreamChunk::TextDelta(t) => text.push_str(&t),
                StreamChunk::Done => done = true,
                _ => {}
            }
        }
        assert!(done);
        assert!(text.contains("sources"));
    }
}
