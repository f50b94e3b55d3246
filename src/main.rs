//! # transcribe-worker
//!
//! Local speech-to-text worker. Loads Whisper-family models on demand,
//! keeps them cached for the life of the process and transcribes
//! base64-encoded audio for a host application.
//!
//! ## Transports:
//! - **http**: JSON endpoints on a loopback port (`/health`, `/status`,
//!   `/warmup`, `/transcribe`)
//! - **stdio**: newline-delimited JSON requests and replies, for hosts that
//!   spawn the worker as a child process
//!
//! ## Application Architecture:
//! - **config**: defaults, `transcriber.toml`, environment, CLI flags
//! - **engine**: one adapter per engine behind a common interface
//! - **cache**: model cache and the exclusive load/inference section
//! - **pipeline**: payload validation, staging, inference, retry
//! - **status**: telemetry read by `/status`
//! - **handlers** / **stdio**: the two transports

mod audio;
mod cache;
mod config;
mod device;
mod engine;
mod error;
mod handlers;
mod health;
mod middleware;
mod pipeline;
mod state;
mod status;
mod stdio;
#[cfg(test)]
mod testing;

use actix_web::{web, App, HttpServer};
use anyhow::Result;
use clap::Parser;
use config::{AppConfig, TransportMode};
use engine::EngineSet;
use error::AppError;
use pipeline::TranscriptionService;
use state::AppState;
use std::fs::OpenOptions;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Command-line flags; they override every other configuration source.
#[derive(Debug, Parser)]
#[command(name = "transcribe-worker", version, about = "Local speech-to-text worker")]
struct Cli {
    /// Configuration file (defaults to ./transcriber.toml when present)
    #[arg(long)]
    config: Option<String>,

    /// Address to listen on in http mode
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on in http mode
    #[arg(long)]
    port: Option<u16>,

    /// Transport to serve
    #[arg(long, value_enum)]
    mode: Option<TransportMode>,
}

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(mode) = cli.mode {
        config.worker.mode = mode;
    }
    config.validate()?;

    init_tracing(&config)?;

    info!("Starting transcribe-worker v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Default engine {} model {} on {}",
        config.defaults.engine, config.defaults.model, config.defaults.device
    );

    let engines = EngineSet::from_config(&config.engines);
    let service = Arc::new(TranscriptionService::new(engines, config.defaults.clone()));

    match config.worker.mode {
        TransportMode::Http => run_http(&config, service).await,
        TransportMode::Stdio => run_stdio(service).await,
    }
}

async fn run_http(config: &AppConfig, service: Arc<TranscriptionService>) -> Result<()> {
    let app_state = AppState::new(service);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let max_body_bytes = config.server.max_body_bytes;
    info!("listening on {}", bind_addr);

    let server = {
        let app_state = app_state.clone();
        HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(app_state.clone()))
                .wrap(middleware::RequestLogging)
                .configure(handlers::configure(max_body_bytes))
        })
        .bind(&bind_addr)?
        .run()
    };

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped after {}s", app_state.get_uptime_seconds());
    Ok(())
}

async fn run_stdio(service: Arc<TranscriptionService>) -> Result<()> {
    let reader = tokio::io::BufReader::new(tokio::io::stdin());
    stdio::serve(service, reader, tokio::io::stdout()).await?;
    info!("stdin closed, exiting");
    Ok(())
}

/// Set up logging to stderr, plus an optional append-only log file.
///
/// stdout is reserved for protocol lines in stdio mode, so nothing is ever
/// logged there.
fn init_tracing(config: &AppConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_filter()));

    let file_layer = match &config.logging.path {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| AppError::Config(format!("cannot open log file {}: {}", path, e)))?;
            Some(fmt::layer().with_writer(Arc::new(file)).with_ansi(false))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(())
}

/// Resolves on Ctrl+C or, on Unix, SIGTERM.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                }
                return;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received SIGINT");
}
