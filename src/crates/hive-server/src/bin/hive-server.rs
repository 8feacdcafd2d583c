//! The hive server binary.

use clap::Parser;
use hive_core::llm::CompletionModel;
use hive_core::tool::ToolRegistry;
use hive_llm::local::OllamaClient;
use hive_llm::remote::ClaudeClient;
use hive_llm::{LocalLlmConfig, RemoteLlmConfig};
use hive_server::api::create_router;
use hive_server::{ProviderKind, ServerConfig, SessionManager};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "hive-server", about = "Agent runtime server")]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bind host override.
    #[arg(long)]
    host: Option<String>,

    /// Bind port override.
    #[arg(long)]
    port: Option<u16>,
}

fn build_model(config: &ServerConfig) -> anyhow::Result<Arc<dyn CompletionModel>> {
    match config.provider.kind {
        ProviderKind::Claude => {
            let base_url = config
                .provider
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.anthropic.com".to_string());
            let remote = RemoteLlmConfig::from_env(
                &config.provider.api_key_env,
                base_url,
                config.provider.model.clone(),
            )?;
            Ok(Arc::new(ClaudeClient::new(remote)))
        }
        ProviderKind::Ollama => {
            let base_url = config
                .provider
                .base_url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string());
            let local = LocalLlmConfig::new(base_url, config.provider.model.clone());
            Ok(Arc::new(OllamaClient::new(local)))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(rust_log))
        .init();

    let args = Args::parse();
    let mut config = ServerConfig::load(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    tracing::info!(
        provider = ?config.provider.kind,
        model = %config.provider.model,
        "starting hive server"
    );
    let model = build_model(&config)?;

    // Domain tools are registered by the deployment; the runtime itself
    // ships only the synthetic pair every node sees.
    let tools = ToolRegistry::new();

    let addr = format!("{}:{}", config.host, config.port);
    let manager = Arc::new(SessionManager::new(config, model, tools));
    let router = create_router(Arc::clone(&manager));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "listening");

    let shutdown_manager = Arc::clone(&manager);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down, stopping all sessions");
            shutdown_manager.stop_all().await;
        })
        .await?;
    Ok(())
}
