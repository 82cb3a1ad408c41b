use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use prism_config::{ConfigLoader, PrismConfig};
use prism_core::Result;
use prism_server::AppState;

#[derive(Parser)]
#[command(name = "prism", version, about = "Deadline-bounded retrieval orchestrator gateway")]
pub struct Cli {
    /// Path to prism.toml (default: PRISM_CONFIG or ./prism.toml).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Debug-level logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Errors only.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Explicit log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP/SSE gateway.
    Serve,
    /// Query a running instance's /health endpoint.
    Status {
        /// Base URL of the running instance.
        #[arg(long, default_value = "http://127.0.0.1:8000")]
        url: String,
    },
    /// Print the resolved configuration.
    Config {
        #[arg(long)]
        json: bool,
    },
    /// Print the version.
    Version,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let loader = ConfigLoader::load(self.config.as_deref())?;
        let config = loader.get();

        let log_level = if self.verbose {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            self.log_level.as_deref().unwrap_or(&config.logging.level)
        };

        if config.logging.format == "json" {
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
                )
                .json()
                .with_target(true)
                .init();
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
                )
                .with_target(false)
                .init();
        }

        match self.command {
            Commands::Serve => cmd_serve(config, loader).await,
            Commands::Status { url } => cmd_status(&url).await,
            Commands::Config { json } => cmd_config(config, json),
            Commands::Version => {
                println!("prism {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

async fn cmd_serve(config: PrismConfig, loader: ConfigLoader) -> Result<()> {
    let state = AppState::from_config(config)?;

    // Keep the hot-reload watcher alive for the life of the server.
    let _watcher = match loader.watch() {
        Ok(w) => Some(w),
        Err(e) => {
            tracing::warn!(error = %e, "config hot-reload unavailable");
            None
        }
    };

    // Warm lanes and the embedder in the background; requests arriving
    // before completion are served cold rather than blocked.
    tokio::spawn({
        let state = Arc::clone(&state);
        async move {
            let report = state
                .warmup
                .warmup(&state.orchestrator, Arc::clone(&state.embedder))
                .await;
            info!(ready = report.ready, total_ms = report.total_ms, "startup warmup done");
        }
    });

    prism_server::start_server(state).await
}

async fn cmd_status(base_url: &str) -> Result<()> {
    let url = format!("{}/health", base_url.trim_end_matches('/'));
    let resp = reqwest::get(&url)
        .await
        .map_err(|e| prism_core::PrismError::Config(format!("cannot reach {url}: {e}")))?;
    let body: serde_json::Value = resp
        .json()
        .await
        .map_err(|e| prism_core::PrismError::Config(format!("bad health payload: {e}")))?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

fn cmd_config(config: PrismConfig, json: bool) -> Result<()> {
    let mut masked = config;
    // Secrets never hit stdout.
    for slot in [
        &mut masked.llm.huggingface_api_key,
        &mut masked.llm.openai_api_key,
        &mut masked.llm.anthropic_api_key,
        &mut masked.retrieval.search_api_key,
        &mut masked.retrieval.vector_db_api_key,
        &mut masked.retrieval.arangodb_password,
        &mut masked.retrieval.meilisearch_master_key,
        &mut masked.auth.jwt_secret_key,
    ] {
        if slot.is_some() {
            *slot = Some("********".into());
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&masked)?);
    } else {
        let rendered = toml::to_string_pretty(&masked)
            .map_err(|e| prism_core::PrismError::Config(e.to_string()))?;
        println!("{rendered}");
    }
    Ok(())
}
