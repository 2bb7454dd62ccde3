use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use sshproxy_core::accept::AcceptLoop;
use sshproxy_core::config::FileConfig;
use sshproxy_core::connection::ProxyServer;
use sshproxy_core::{AcceptAllPolicy, AcceptAnyHostKeyPolicy, ServerConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;

/// Transparent man-in-the-middle SSH proxy: terminates an inbound session
/// and splices it onto a fixed upstream at the channel layer.
#[derive(Parser, Debug)]
#[command(name = "sshproxy", version, about)]
struct Cli {
    /// Path to a TOML config file. Defaults to ./sshproxy.toml if present.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on, e.g. 0.0.0.0:2222.
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Upstream SSH server to splice onto, e.g. localhost:22.
    #[arg(long)]
    upstream: Option<String>,

    /// User to authenticate as against the upstream.
    #[arg(long)]
    upstream_user: Option<String>,

    /// Path to this proxy's host key (PEM).
    #[arg(long)]
    host_key: Option<PathBuf>,

    /// Path to the private key this proxy presents to the upstream (PEM).
    #[arg(long)]
    client_identity: Option<PathBuf>,

    /// tracing-subscriber filter string, e.g. sshproxy=debug,warn.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(ServerConfig::default_config_path);
    let file_config = match FileConfig::load_if_present(&config_path) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("loading config: {err}");
            return ExitCode::FAILURE;
        }
    };

    let log_level = cli
        .log_level
        .clone()
        .or(file_config.log_level.clone())
        .unwrap_or_else(|| "sshproxy=info,warn".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .init();

    let resolved = match config::resolve(&cli, &file_config) {
        Ok(resolved) => resolved,
        Err(err) => {
            error!(%err, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let host_key = match sshproxy_core::keys::load_signer(&resolved.host_key_path, None) {
        Ok(key) => key,
        Err(err) => {
            error!(%err, "loading host key");
            return ExitCode::FAILURE;
        }
    };
    let client_identity = match sshproxy_core::keys::load_signer(&resolved.client_identity_path, None) {
        Ok(key) => key,
        Err(err) => {
            error!(%err, "loading client identity");
            return ExitCode::FAILURE;
        }
    };

    let ssh_config = Arc::new(russh::server::Config {
        keys: vec![host_key],
        ..Default::default()
    });

    let server = ProxyServer {
        config: Arc::new(resolved.clone()),
        auth_policy: Arc::new(AcceptAllPolicy),
        host_key_policy: Arc::new(AcceptAnyHostKeyPolicy),
        client_identity: Arc::new(client_identity),
    };

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received");
        shutdown.cancel();
    });

    let accept_loop = AcceptLoop::new(Arc::new(resolved), ssh_config, server);
    match accept_loop.run(cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "accept loop failed");
            ExitCode::FAILURE
        }
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
