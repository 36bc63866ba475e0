//! gsc-server: game server console.
//!
//! Supervises one external game server process, streams its console to any
//! number of WebSocket viewers, and exposes a thin HTTP control surface
//! (start/stop/status).

mod broadcast;
mod config;
mod control;
mod gateway;
mod supervisor;

use broadcast::LogBroadcaster;
use clap::Parser;
use config::ServerConfig;
use gateway::{ConsoleGateway, GatewayConfig};
use std::net::SocketAddr;
use std::path::Path;
use supervisor::{Supervisor, SupervisorConfig};
use tracing::{error, info};

/// gsc-server — game server console
#[derive(Parser, Debug)]
#[command(name = "gsc-server", version, about = "Game server console")]
struct Cli {
    /// HTTP control port
    #[arg(long)]
    control_port: Option<u16>,

    /// WebSocket console port
    #[arg(long)]
    console_port: Option<u16>,

    /// Launch path of the game server binary or start script
    #[arg(long)]
    launch_path: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.gsc/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config_path = Path::new(&cli.config);
    let config = match ServerConfig::load(
        Some(config_path),
        cli.control_port,
        cli.console_port,
        cli.launch_path.as_deref(),
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        control_port = config.control_port,
        console_port = config.console_port,
        "starting gsc-server"
    );

    let broadcaster = LogBroadcaster::new(config.backlog, config.queue_capacity);
    let supervisor = Supervisor::new(
        SupervisorConfig {
            launch_path: config.launch_path.clone(),
            working_dir: config.working_dir.clone(),
            shutdown_command: config.shutdown_command.clone(),
            grace_period: config.grace_period,
        },
        broadcaster.clone(),
    );
    let gateway = ConsoleGateway::new(
        supervisor.clone(),
        broadcaster.clone(),
        GatewayConfig {
            heartbeat_interval: config.heartbeat_interval,
            missed_probe_limit: config.missed_probe_limit,
        },
    );

    let control_addr = SocketAddr::new(config.bind_addr, config.control_port);
    let console_addr = SocketAddr::new(config.bind_addr, config.console_port);

    let control_listener = match tokio::net::TcpListener::bind(control_addr).await {
        Ok(listener) => {
            info!(addr = %control_addr, "control listener started");
            listener
        }
        Err(e) => {
            error!(addr = %control_addr, error = %e, "control bind failed");
            std::process::exit(1);
        }
    };
    let console_listener = match ConsoleGateway::bind(console_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, "console bind failed");
            std::process::exit(1);
        }
    };

    let app = control::router(supervisor.clone());

    tokio::select! {
        result = axum::serve(control_listener, app) => {
            if let Err(e) = result {
                error!(error = %e, "control server error");
            }
        }
        result = gateway.serve(console_listener) => {
            if let Err(e) = result {
                error!(error = %e, "console server error");
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    // Take the managed process down with us.
    if supervisor.state().is_active() {
        if let Err(e) = supervisor.stop().await {
            error!(error = %e, "failed to stop server process on shutdown");
        }
    }

    info!("gsc-server stopped");
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
