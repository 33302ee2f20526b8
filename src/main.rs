//! Voxgate - Real-time voice dialog gateway

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use voxgate::config::Config;

#[derive(Parser)]
#[command(name = "voxgate", version, about = "Real-time voice dialog gateway")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install Rustls crypto provider for outbound TLS (required for
    // Rustls 0.23+ when more than one provider is linked in)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install Rustls crypto provider");

    let cli = Cli::parse();
    let config = Arc::new(Config::load_from(&cli.config)?);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log.level.clone())),
        )
        .init();

    info!("Starting voice dialog gateway");
    info!("  WebSocket port: {}", config.server.port);
    info!("  HTTP port:      {}", config.server.http_port);
    info!("  ASR:  {}", config.selected_module.asr);
    info!("  LLM:  {}", config.selected_module.llm);
    info!("  TTS:  {}", config.selected_module.tts);
    info!("  VAD:  {}", config.selected_module.vad);
    info!("  VLLM: {}", config.selected_module.vllm);

    voxgate::server::start(config).await
}
