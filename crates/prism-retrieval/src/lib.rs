//! # prism-retrieval
//!
//! The retrieval half of the pipeline: three independent lane adapters
//! (web, vector, knowledge-graph), the parallel orchestrator that fans out
//! to them under hard deadlines, weighted rank fusion with deduplication,
//! and the one-shot warmup manager.

pub mod embedding;
pub mod fusion;
pub mod kg;
pub mod lane;
pub mod mock;
pub mod orchestrator;
pub mod vector;
pub mod warmup;
pub mod web;

pub use embedding::{EmbeddingProvider, HashingEmbedding};
pub use fusion::{FusionConfig, fuse};
pub use lane::RetrievalLane;
pub use mock::MockLane;
pub use orchestrator::{LaneOrchestrator, OrchestratorOutput};
pub use warmup::{WarmupManager, WarmupReport};
