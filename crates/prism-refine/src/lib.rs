//! # prism-refine
//!
//! The guided-prompt stage: a short, cheap LLM call that proposes query
//! refinements before retrieval runs. Strictly budgeted (500 ms, 300
//! output tokens, 1% of the daily spend) and skipped entirely whenever the
//! trigger rules say the query is already clear.

pub mod engine;
pub mod trigger;
pub mod validate;

pub use engine::{RefineContext, RefineEngine, RefinementResult, Suggestion, SuggestionKind};
pub use trigger::intent_confidence;
