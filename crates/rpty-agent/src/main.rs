//! rpty-agent: reconnecting PTY server.
//!
//! Listens on TCP and serves terminal sessions that clients can leave and
//! rejoin by ID.

use anyhow::{Context, Result};
use clap::Parser;
use rpty_agent::config::{AgentConfig, Overrides};
use rpty_agent::metrics::FailureCounters;
use rpty_agent::server::AgentServer;
use rpty_core::BackendType;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// rpty-agent: reconnecting PTY server
#[derive(Parser, Debug)]
#[command(name = "rpty-agent", version, about = "Reconnecting PTY server")]
struct Cli {
    /// Listen address (host:port)
    #[arg(short, long)]
    listen: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.rpty/config.toml")]
    config: String,

    /// Idle timeout in seconds for sessions with nothing attached
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Scrollback backend (auto, ring_buffer, multiplexer)
    #[arg(long)]
    backend: Option<BackendType>,

    /// Ring-buffer scrollback size in bytes
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting rpty-agent");

    let config_path = PathBuf::from(&cli.config);
    let config = AgentConfig::load(
        Some(&config_path),
        Overrides {
            listen: cli.listen,
            idle_timeout: cli.idle_timeout,
            backend: cli.backend,
            buffer_size: cli.buffer_size,
        },
    )
    .context("failed to load config")?;

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to listen on {}", config.listen))?;

    let metrics = Arc::new(FailureCounters::new());
    let shutdown = CancellationToken::new();
    let options = config.session_options(metrics.clone());
    info!(
        idle_timeout_secs = config.idle_timeout.as_secs(),
        backend = %config.backend,
        shell = %config.shell,
        "session defaults"
    );
    let server = AgentServer::new(config, options, shutdown.clone());

    let mut run = tokio::spawn(server.run(listener));
    let result = tokio::select! {
        result = &mut run => result,
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            shutdown.cancel();
            run.await
        }
    };

    for (kind, count) in metrics.snapshot() {
        info!(kind = %kind, count, "session failures");
    }

    match result {
        Ok(Ok(())) => {
            info!("rpty-agent stopped");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %e, "server error");
            Err(e.into())
        }
        Err(e) => Err(anyhow::anyhow!("server task failed: {e}")),
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
