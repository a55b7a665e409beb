//! Relay Daemon - SSE streaming endpoint
//!
//! Serves the relay's streaming endpoint over HTTP. Configuration comes from
//! defaults, an optional TOML file, `RELAY_*` environment variables and the
//! flags below, in that order.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (Ollama on localhost:11434)
//! relay-daemon
//!
//! # Echo provider, custom address
//! relay-daemon --provider echo --listen 0.0.0.0:8787
//!
//! # With config file
//! relay-daemon --config /etc/sse-relay/relay.toml
//!
//! # Verbose logging
//! RUST_LOG=debug relay-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: graceful shutdown. Live streams are aborted, still
//!   write their terminal frame and release their reservations.

mod server;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use relay_core::{
    EchoProvider, GenerationProvider, InMemoryPersistence, OllamaProvider, ProviderKind, RelayConfig,
    StreamController, SystemClock,
};
use server::{router, AppState};

/// How long shutdown waits for sessions to finalize
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Relay Daemon - SSE streaming endpoint
#[derive(Parser, Debug)]
#[command(name = "relay-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "RELAY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, value_name = "ADDR")]
    listen: Option<String>,

    /// Generation provider (ollama, echo)
    #[arg(short = 'p', long, value_name = "NAME")]
    provider: Option<String>,

    /// Model name passed to the provider
    #[arg(short = 'm', long, value_name = "MODEL")]
    model: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "RELAY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("relay_daemon={level},relay_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

/// Resolve configuration: file and environment, then CLI flags
fn load_config(args: &Args) -> Result<RelayConfig> {
    let mut config = RelayConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    if let Some(listen) = &args.listen {
        config.server.listen_addr.clone_from(listen);
    }
    if let Some(provider) = &args.provider {
        config.provider.kind = provider.parse::<ProviderKind>()?;
    }
    if let Some(model) = &args.model {
        config.provider.model.clone_from(model);
    }
    config.validate()?;
    Ok(config)
}

fn build_provider(config: &RelayConfig) -> Arc<dyn GenerationProvider> {
    match config.provider.kind {
        ProviderKind::Ollama => Arc::new(OllamaProvider::from_config(&config.provider)),
        ProviderKind::Echo => Arc::new(EchoProvider::default()),
    }
}

/// Resolve once SIGTERM or SIGINT arrives, then cancel `shutdown`
async fn shutdown_signal(shutdown: CancellationToken) {
    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
                _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
                () = shutdown.cancelled() => {}
            }
        }
        (Err(e), _) | (_, Err(e)) => {
            warn!(error = %e, "Failed to install signal handlers, falling back to ctrl-c");
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for ctrl-c");
            }
        }
    }
    shutdown.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!("Relay Daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args)?;
    info!(
        listen = %config.server.listen_addr,
        provider = %config.provider.kind,
        model = %config.provider.model,
        first_token_timeout_ms = config.stream.first_token_timeout_ms,
        idle_timeout_ms = config.stream.idle_timeout_ms,
        "Configuration loaded"
    );

    let shutdown = CancellationToken::new();
    let controller = Arc::new(StreamController::new(
        build_provider(&config),
        Arc::new(InMemoryPersistence::new()),
        &config,
        SystemClock::shared(),
        shutdown.clone(),
    ));

    let app = router(AppState {
        controller: Arc::clone(&controller),
    });

    let listener = tokio::net::TcpListener::bind(&config.server.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.listen_addr))?;
    info!(addr = %config.server.listen_addr, "Listening");

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await;

    info!("Shutting down...");
    shutdown.cancel();
    if !controller.drain(DRAIN_TIMEOUT).await {
        warn!(
            remaining = controller.stats().active_sessions,
            "Sessions still running after drain timeout"
        );
    }

    match result {
        Ok(()) => {
            info!("Relay daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e.into())
        }
    }
}
