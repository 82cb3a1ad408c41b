//! # prism-llm
//!
//! Abstraction layer over LLM providers: the provider trait, adapters for
//! Ollama / OpenAI / Anthropic / HuggingFace plus an always-available stub,
//! per-provider health with circuit breaking, and the scoring router that
//! picks a `(provider, model)` pair per request and fails over on error.

pub mod anthropic;
pub mod health;
pub mod huggingface;
pub mod mock;
pub mod ollama;
pub mod openai;
pub mod provider;
pub mod registry;
pub mod scoring;
pub mod stub;

pub use health::{CircuitState, HealthSnapshot, HealthTable};
pub use mock::MockProvider;
pub use provider::{CompletionRequest, CompletionResponse, LlmProvider, StreamChunk, TokenUsage};
pub use registry::ProviderRegistry;
pub use scoring::{RouteDecision, RouteQuery, ScoringRouter, SynthesisOutcome};
