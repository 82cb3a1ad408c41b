//! # prism-core
//!
//! Core types, errors, and primitives for the Prism retrieval orchestrator.
//! This crate defines the shared vocabulary used by every other crate in the
//! workspace: lanes, sources, query requests, the unified error type, trace
//! IDs, and the deadline-bounded execution primitive.

pub mod deadline;
pub mod error;
pub mod trace;
pub mod types;

pub use deadline::{Deadline, DeadlineError, run_with_deadline};
pub use error::{ErrorKind, PrismError, Result};
pub use trace::TraceId;
pub use types::*;
