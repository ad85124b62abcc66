//! Balancer Daemon - Tiered Load Balancer for Ollama Servers
//!
//! Entry point for the `balancer-daemon` binary: resolves configuration,
//! loads the server registry, serves the HTTP surface and refreshes the
//! registry in the background until a shutdown signal arrives.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (~/.config/ollama-balancer/balancer.toml if present)
//! balancer-daemon
//!
//! # Explicit config and registry
//! balancer-daemon --config /etc/ollama-balancer/balancer.toml --registry /etc/ollama-balancer/servers.toml
//!
//! # Override the listen address and write a PID file
//! balancer-daemon --bind 127.0.0.1:11500 --pid-file /run/ollama-balancer.pid
//!
//! # Verbose logging
//! RUST_LOG=debug balancer-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: stop accepting connections, let in-flight
//!   responses finish, stop the refresh task, remove the PID file

use std::fs;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use balancer_core::{default_config_path, load_config_from_path, BalancerConfig, ConfigOverrides};
use balancer_daemon::{build_router, AppState};

/// Balancer Daemon - tiered, health- and resource-aware proxy for Ollama servers
#[derive(Parser, Debug)]
#[command(name = "balancer-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "BALANCER_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen address, overriding config and environment
    #[arg(short = 'b', long, value_name = "ADDR")]
    bind: Option<SocketAddr>,

    /// Server registry file, overriding config and environment
    #[arg(short = 'r', long, value_name = "FILE")]
    registry: Option<PathBuf>,

    /// Attempts per request, overriding config and environment
    #[arg(long, value_name = "N")]
    max_retry: Option<u32>,

    /// PID file path
    #[arg(long, env = "BALANCER_PID_FILE", value_name = "PATH")]
    pid_file: Option<PathBuf>,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(addr) = self.bind {
            overrides = overrides.with_bind_address(addr);
        }
        if let Some(ref path) = self.registry {
            overrides = overrides.with_registry_path(path.clone());
        }
        if let Some(count) = self.max_retry {
            overrides = overrides.with_max_retry_count(count);
        }
        overrides
    }
}

/// Write PID file
fn write_pid_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create PID directory: {parent:?}"))?;
    }

    let pid = std::process::id();
    let mut file =
        fs::File::create(path).with_context(|| format!("Failed to create PID file: {path:?}"))?;
    writeln!(file, "{pid}")?;

    info!(pid = pid, path = ?path, "PID file created");
    Ok(())
}

/// Remove PID file
fn remove_pid_file(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!(error = %e, path = ?path, "Failed to remove PID file");
        } else {
            info!(path = ?path, "PID file removed");
        }
    }
}

/// Refuse to start when the PID file names a live process
fn check_existing_daemon(pid_path: &Path) -> Result<()> {
    if !pid_path.exists() {
        return Ok(());
    }

    let pid_str = fs::read_to_string(pid_path)
        .with_context(|| format!("Failed to read PID file: {pid_path:?}"))?;

    let pid: i32 = pid_str
        .trim()
        .parse()
        .with_context(|| "Invalid PID in file")?;

    // Signal 0 only checks existence
    if kill(Pid::from_raw(pid), None).is_ok() {
        anyhow::bail!(
            "Another balancer-daemon is already running (PID: {pid}). \
             Stop it first or remove {pid_path:?} if it's stale."
        );
    }

    warn!(pid = pid, "Removing stale PID file");
    fs::remove_file(pid_path)?;
    Ok(())
}

/// Initialize logging; `RUST_LOG` adds to or overrides the defaults
fn init_logging() -> Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive("balancer_daemon=info".parse()?)
        .add_directive("balancer_core=info".parse()?)
        .add_directive("tower_http=info".parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    Ok(())
}

/// Resolve on the first of SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
        info!("Received SIGINT, initiating shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM, initiating shutdown");
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

async fn run(config: BalancerConfig) -> Result<()> {
    let bind_address = config.bind_address;
    let refresh_interval = config.refresh_interval;

    let state = AppState::from_config(config).await?;
    let stats = state.scheduler.registry().stats();
    info!(
        servers = stats.total,
        active = stats.active,
        virtual_models = stats.virtual_models,
        "Server registry ready"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let refresh = state
        .scheduler
        .registry()
        .spawn_refresh(refresh_interval, shutdown_rx);

    let listener = TcpListener::bind(bind_address)
        .await
        .with_context(|| format!("Failed to bind {bind_address}"))?;
    info!(address = %bind_address, "Listening");

    let served = axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    let _ = shutdown_tx.send(true);
    if let Err(e) = refresh.await {
        warn!(error = %e, "Registry refresh task ended abnormally");
    }

    served.context("HTTP server failed")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging()?;

    info!("Balancer daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    let config_path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(config_path).context("Failed to load configuration")?;
    args.overrides().apply(&mut config);
    config
        .validate()
        .context("Invalid configuration after command-line overrides")?;

    info!(
        source = %config.source(),
        config_file = ?config.config_file_path,
        bind = %config.bind_address,
        registry = ?config.registry_path,
        max_retry_count = config.scheduler.max_retry_count,
        fail_closed = config.scheduler.fail_closed,
        "Configuration resolved"
    );

    if let Some(ref pid_path) = args.pid_file {
        check_existing_daemon(pid_path)?;
        write_pid_file(pid_path)?;
    }

    let result = run(config).await;

    info!("Shutting down...");
    if let Some(ref pid_path) = args.pid_file {
        remove_pid_file(pid_path);
    }

    match result {
        Ok(()) => {
            info!("Balancer daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}
