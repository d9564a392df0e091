//! ccdash-agent - single-host dashboard agent
//!
//! Wires the core subsystems together: tmux driver, lifecycle poller,
//! scrollback store, and the WebSocket server, then runs until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};

use ccdash_core::config::{self, Config};
use ccdash_core::poller::DEFAULT_POLL_INTERVAL;
use ccdash_core::{Poller, ScrollbackStore, Server, TmuxDriver};

#[derive(Parser, Debug)]
#[command(name = "ccdash-agent")]
#[command(about = "Expose tmux-hosted Claude Code sessions to a remote dashboard")]
#[command(version)]
struct Args {
    /// Path to the config file (default: ~/.ccdash/agent.yaml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the bind address (e.g. 0.0.0.0 for local testing)
    #[arg(long)]
    bind: Option<String>,

    /// Override the port
    #[arg(long)]
    port: Option<u16>,
}

fn log_filter() -> tracing_subscriber::EnvFilter {
    let level = if let Ok(v) = std::env::var("RUST_LOG") {
        v
    } else if let Ok(v) = std::env::var("CCDASH_LOG_LEVEL") {
        v
    } else {
        "info".to_string()
    };

    tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_path = args.config.unwrap_or_else(config::default_config_path);
    let mut config = Config::load(&config_path)?;
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    let config = Arc::new(config);

    let tmux = Arc::new(TmuxDriver::new());
    if !tmux.available().await {
        bail!("tmux is not installed or not in PATH");
    }

    let bind_addr = if config.bind.is_empty() {
        match tailscale_ip().await {
            Some(ip) => ip,
            None => {
                warn!("could not detect a Tailscale IP; binding to 127.0.0.1 (local only), use --bind to override");
                "127.0.0.1".to_string()
            }
        }
    } else {
        config.bind.clone()
    };
    let listen_addr = format!("{}:{}", bind_addr, config.port);

    let scrollback = Arc::new(ScrollbackStore::new(
        config.scrollback_dir(),
        config.dump_interval(),
        Arc::clone(&tmux),
    ));
    scrollback.start().context("starting scrollback store")?;

    let poller = Arc::new(Poller::new(Arc::clone(&tmux)));

    let server = Server::new(
        Arc::clone(&config),
        Arc::clone(&tmux),
        Arc::clone(&poller),
        Arc::clone(&scrollback),
    );

    // The poller publishes into the hub; the hub only ever reads snapshots
    // back, so there is no ownership cycle.
    {
        let server = Arc::clone(&server);
        poller.set_on_change(move |sessions| server.broadcast_sessions(sessions));
    }
    poller.start(DEFAULT_POLL_INTERVAL);

    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("binding {listen_addr}"))?;

    info!(version = env!("CARGO_PKG_VERSION"), addr = %listen_addr, "ccdash-agent listening");
    if config.token.is_empty() {
        warn!("no auth token configured");
    } else {
        info!("auth token configured");
    }
    info!(dir = %scrollback.dir().display(), "scrollback dir");

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let server_task = tokio::spawn(Arc::clone(&server).run(listener, shutdown_tx.subscribe()));

    wait_for_signal().await;
    info!("shutting down");

    let _ = shutdown_tx.send(());
    poller.stop();
    scrollback.stop().await;
    let _ = server_task.await;

    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Probe `tailscale ip -4` for the tailnet address so the agent is reachable
/// from the dashboard without being exposed on every interface.
async fn tailscale_ip() -> Option<String> {
    let output = tokio::process::Command::new("tailscale")
        .args(["ip", "-4"])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let ip = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if !ip.is_empty() && ip.starts_with("100.") {
        return Some(ip);
    }
    None
}
