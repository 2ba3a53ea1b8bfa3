//! mudgate-server: session-persisting WebSocket ↔ telnet reverse proxy.
//!
//! Browsers cannot open raw TCP/TLS sockets; this proxy accepts their
//! WebSocket connections and anchors each onto a long-lived MUD-server
//! connection that survives client disconnects.

use clap::Parser;
use mudgate_server::ops::{self, OpsState};
use mudgate_server::{ProxyConfig, ProxyServer};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

/// mudgate-server — WebSocket to MUD proxy
#[derive(Parser, Debug)]
#[command(name = "mudgate-server", version, about = "Session-persisting WebSocket to telnet proxy")]
struct Cli {
    /// WebSocket listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Operational endpoint port (/health, /stats)
    #[arg(long)]
    ops_port: Option<u16>,

    /// Upstream address, e.g. tls://mud.example.org:7443
    #[arg(short, long)]
    upstream: Option<String>,

    /// Default persistence timeout in milliseconds
    #[arg(long)]
    persistence_timeout: Option<i64>,

    /// Default replay buffer line limit
    #[arg(long)]
    max_buffer_lines: Option<i64>,

    /// Prepend a PROXY protocol v1 header on upstream connections
    #[arg(long)]
    proxy_protocol: bool,

    /// Config file path
    #[arg(long, default_value = "~/.mudgate/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting mudgate-server");

    let config_path = PathBuf::from(&cli.config);
    let config = match ProxyConfig::load(
        Some(&config_path),
        cli.port,
        cli.ops_port,
        cli.upstream.as_deref(),
        cli.persistence_timeout,
        cli.max_buffer_lines,
        cli.proxy_protocol,
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let server = match ProxyServer::new(config.clone()) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "failed to create server");
            std::process::exit(1);
        }
    };

    let listener = match server.bind().await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, port = config.port, "failed to bind listener");
            std::process::exit(1);
        }
    };

    // Ops endpoints run on their own port; losing them never takes the
    // proxy down.
    let ops_state = Arc::new(OpsState {
        registry: server.registry(),
        config: config.clone(),
        started: Instant::now(),
    });
    tokio::spawn(async move {
        if let Err(e) = ops::serve(ops_state).await {
            error!(error = %e, "ops endpoints stopped");
        }
    });

    tokio::select! {
        result = server.run(listener) => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    server.shutdown().await;
    info!("mudgate-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
