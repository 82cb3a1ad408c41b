use notify::{Event as NotifyEvent, EventKind, RecursiveMode, Watcher};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::schema::PrismConfig;
use prism_core::{PrismError, Result};

/// Loads and optionally hot-reloads the Prism configuration.
pub struct ConfigLoader {
    config: Arc<RwLock<PrismConfig>>,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > PRISM_CONFIG env > ./prism.toml.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("PRISM_CONFIG") {
            return PathBuf::from(p);
        }
        PathBuf::from("prism.toml")
    }

    /// Load the config from disk, falling back to defaults, then apply the
    /// environment overrides and validate. Fails fast on hard errors.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            let raw = std::fs::read_to_string(&config_path)?;
            toml::from_str::<PrismConfig>(&raw).map_err(|e| {
                PrismError::Config(format!("failed to parse {}: {}", config_path.display(), e))
            })?
        } else {
            info!(?config_path, "config file not found, using defaults");
            PrismConfig::default()
        };

        let config = Self::apply_env_overrides(config);

        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
            }
            Err(e) => return Err(PrismError::Config(e)),
        }

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Get a read snapshot of the current config.
    pub fn get(&self) -> PrismConfig {
        self.config.read().clone()
    }

    /// Get a shared reference for components that follow hot reloads.
    pub fn shared(&self) -> Arc<RwLock<PrismConfig>> {
        Arc::clone(&self.config)
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Apply every recognized environment knob on top of the file config.
    /// Config values already set in the file keep priority for credentials;
    /// tuning knobs from the environment always win.
    fn apply_env_overrides(mut config: PrismConfig) -> PrismConfig {
        fn env_u64(key: &str) -> Option<u64> {
            std::env::var(key).ok().and_then(|v| v.parse().ok())
        }
        fn env_usize(key: &str) -> Option<usize> {
            std::env::var(key).ok().and_then(|v| v.parse().ok())
        }
        fn env_bool(key: &str) -> Option<bool> {
            std::env::var(key)
                .ok()
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        }
        fn env_str(key: &str) -> Option<String> {
            std::env::var(key).ok().filter(|v| !v.is_empty())
        }

        // Budgets and timeouts.
        if let Some(v) = env_u64("LLM_TIMEOUT_SECONDS") {
            config.llm.timeout_secs = v;
        }
        if let Some(v) = env_u64("RETRIEVAL_TIMEOUT_MS") {
            config.retrieval.total_budget_ms = v;
        }
        if let Some(v) = env_u64("WEB_TIMEOUT_MS") {
            config.retrieval.web_timeout_ms = v;
        }
        if let Some(v) = env_u64("VECTOR_TIMEOUT_MS") {
            config.retrieval.vector_timeout_ms = v;
        }
        if let Some(v) = env_u64("KG_TIMEOUT_MS") {
            config.retrieval.kg_timeout_ms = v;
        }
        if let Some(v) = env_u64("FUSION_TIMEOUT_MS") {
            config.retrieval.fusion_timeout_ms = v;
        }
        if let Some(v) = env_usize("RETRIEVAL_TOP_K") {
            config.retrieval.web_top_k = v;
            config.retrieval.vector_top_k = v;
        }

        // Lane toggles and the paid gate.
        if let Some(v) = env_bool("ENABLE_WEB_SEARCH") {
            config.retrieval.enable_web = v;
        }
        if let Some(v) = env_bool("ENABLE_VECTOR_SEARCH") {
            config.retrieval.enable_vector = v;
        }
        if let Some(v) = env_bool("ENABLE_KNOWLEDGE_GRAPH") {
            config.retrieval.enable_kg = v;
        }
        if let Some(v) = env_bool("ENABLE_PAID_API") {
            config.llm.enable_paid_api = v;
        }

        // Provider credentials: env fills in when the file left them unset.
        if config.llm.ollama_base_url.is_none() {
            config.llm.ollama_base_url = env_str("OLLAMA_BASE_URL");
        }
        if config.llm.huggingface_api_key.is_none() {
            config.llm.huggingface_api_key = env_str("HUGGINGFACE_API_KEY");
        }
        if config.llm.openai_api_key.is_none() {
            config.llm.openai_api_key = env_str("OPENAI_API_KEY");
        }
        if config.llm.anthropic_api_key.is_none() {
            config.llm.anthropic_api_key = env_str("ANTHROPIC_API_KEY");
        }
        if config.llm.gpu_remote_url.is_none() {
            config.llm.gpu_remote_url = env_str("GPU_REMOTE_URL");
        }

        // Datastores.
        if config.retrieval.vector_db_url.is_none() {
            config.retrieval.vector_db_url = env_str("VECTOR_DB_URL");
        }
        if config.retrieval.vector_db_api_key.is_none() {
            config.retrieval.vector_db_api_key = env_str("VECTOR_DB_API_KEY");
        }
        if config.retrieval.arangodb_url.is_none() {
            config.retrieval.arangodb_url = env_str("ARANGODB_URL");
        }
        if config.retrieval.arangodb_username.is_none() {
            config.retrieval.arangodb_username = env_str("ARANGODB_USERNAME");
        }
        if config.retrieval.arangodb_password.is_none() {
            config.retrieval.arangodb_password = env_str("ARANGODB_PASSWORD");
        }
        if let Some(v) = env_str("ARANGODB_DATABASE") {
            config.retrieval.arangodb_database = v;
        }
        if config.retrieval.meilisearch_url.is_none() {
            config.retrieval.meilisearch_url = env_str("MEILISEARCH_URL");
        }
        if config.retrieval.meilisearch_master_key.is_none() {
            config.retrieval.meilisearch_master_key = env_str("MEILISEARCH_MASTER_KEY");
        }

        // Auth.
        if config.auth.jwt_secret_key.is_none() {
            config.auth.jwt_secret_key = env_str("JWT_SECRET_KEY");
        }

        // Operational knobs.
        if let Some(v) = env_str("PRISM_SERVER_LISTEN") {
            config.server.listen = v;
        }
        if let Some(v) = env_str("PRISM_LOG_LEVEL") {
            config.logging.level = v;
        }

        config
    }

    /// Reload the config from disk.
    pub fn reload(&self) -> Result<()> {
        if !self.config_path.exists() {
            return Err(PrismError::Config(format!(
                "config file not found: {}",
                self.config_path.display()
            )));
        }
        let raw = std::fs::read_to_string(&self.config_path)?;
        let new_config = toml::from_str::<PrismConfig>(&raw).map_err(|e| {
            PrismError::Config(format!(
                "failed to parse {}: {}",
                self.config_path.display(),
                e
            ))
        })?;
        let new_config = Self::apply_env_overrides(new_config);
        *self.config.write() = new_config;
        info!("configuration reloaded");
        Ok(())
    }

    /// Start a background file watcher that swaps the shared config when the
    /// file changes. A file that fails to parse keeps the current config.
    /// Returns the watcher handle; drop it to stop watching.
    pub fn watch(&self) -> Result<notify::RecommendedWatcher> {
        let config = Arc::clone(&self.config);
        let config_path = self.config_path.clone();

        info!(?config_path, "starting config file watcher");

        let path_for_event = config_path.clone();
        let mut watcher =
            notify::recommended_watcher(move |res: std::result::Result<NotifyEvent, notify::Error>| {
                match res {
                    Ok(event) => {
                        if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                            return;
                        }
                        let is_our_file = event
                            .paths
                            .iter()
                            .any(|p| p.file_name() == path_for_event.file_name());
                        if !is_our_file {
                            return;
                        }

                        info!("config file changed, reloading");
                        match std::fs::read_to_string(&path_for_event) {
                            Ok(raw) => match toml::from_str::<PrismConfig>(&raw) {
                                Ok(new_config) => {
                                    let new_config = ConfigLoader::apply_env_overrides(new_config);
                                    *config.write() = new_config;
                                    info!("configuration hot-reloaded");
                                }
                                Err(e) => {
                                    warn!(error = %e, "config file has errors, keeping current config");
                                }
                            },
                            Err(e) => {
                                warn!(error = %e, "failed to read config file during hot-reload");
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "file watcher error");
                    }
                }
            })
            .map_err(|e| PrismError::Config(format!("failed to create file watcher: {}", e)))?;

        // Watch the parent directory (some editors write temp files + rename).
        let watch_path = self.config_path.parent().unwrap_or(Path::new("."));
        watcher
            .watch(watch_path, RecursiveMode::NonRecursive)
            .map_err(|e| PrismError::Config(format!("failed to watch config directory: {}", e)))?;

        Ok(watcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let loader = ConfigLoader::load(Some(Path::new("/nonexistent/prism.toml"))).unwrap();
        let cfg = loader.get();
        assert_eq!(cfg.retrieval.total_budget_ms, 3_000);
    }

    #[test]
    fn test_load_file_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prism.toml");
        {
            let mut f = std::fs::File::create(&path).unwrap();
            writeln!(f, "[retrieval]\ntotal_budget_ms = 1234").unwrap();
        }

        let loader = ConfigLoader::load(Some(&path)).unwrap();
        assert_eq!(loader.get().retrieval.total_budget_ms, 1234);

        {
            let mut f = std::fs::File::create(&path).unwrap();
            writeln!(f, "[retrieval]\ntotal_budget_ms = 4321").unwrap();
        }
        loader.reload().unwrap();
        assert_eq!(loader.get().retrieval.total_budget_ms, 4321);
    }

    #[test]
    fn test_bad_toml_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prism.toml");
        std::fs::write(&path, "this is not toml [[[").unwrap();
        assert!(ConfigLoader::load(Some(&path)).is_err());
    }
}
