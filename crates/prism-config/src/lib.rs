//! # prism-config
//!
//! Configuration system for the Prism gateway. Reads from `prism.toml`,
//! environment variables, and CLI overrides, in that precedence order.
//! Also owns the model catalog (provider and model descriptors the scoring
//! router consumes as data).
//!
//! Supports hot-reload via filesystem watcher.

pub mod catalog;
pub mod loader;
pub mod schema;

pub use catalog::{ModelCatalog, ModelDescriptor, ProviderDescriptor, ProviderTier};
pub use loader::ConfigLoader;
pub use schema::{ConfigWarning, PrismConfig, WarningSeverity};
