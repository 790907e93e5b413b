//! Visitor intelligence service for Zentinel
//!
//! Serves the pixel, telemetry, side-channel and cloak-gated routes.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use zentinel_visitor_intel::{server, VisitorIntelConfig, VisitorIntelEngine};

#[derive(Parser, Debug)]
#[command(name = "zentinel-visitor-intel")]
#[command(author, version, about = "Visitor identification and anomaly correlation for Zentinel")]
struct Args {
    /// Address for the HTTP server
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Path to configuration file (JSON or YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to crawler signatures database
    #[arg(long, default_value = "data/crawler_signatures.json")]
    signatures: PathBuf,

    /// Enable JSON logging format
    #[arg(long)]
    json_logs: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(json: bool, level: &str) {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter = EnvFilter::from_default_env().add_directive(level.into());

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer())
            .init();
    }
}

fn load_config(path: &Path) -> Result<VisitorIntelConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;

    let config = if path.extension().is_some_and(|e| e == "yaml" || e == "yml") {
        serde_yaml::from_str(&content)?
    } else {
        serde_json::from_str(&content)?
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(args.json_logs, &args.log_level);

    // Load configuration
    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => VisitorIntelConfig::default(),
    };

    if config.identity.token_secret == VisitorIntelConfig::default().identity.token_secret {
        tracing::warn!("Using the default token secret; set identity.token_secret");
    }

    let engine = VisitorIntelEngine::new(config, &args.signatures).await?;

    info!(address = %args.listen, "Starting visitor intelligence service");
    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;

    server::serve(listener, Arc::new(engine)).await
}
