//! `iot_server`: run the device server against locally-attached serial
//! microcontrollers.
//!
//! Wires together the pieces spec §2's data-flow paragraph describes: a
//! [`SerialScanner`] feeds a shared [`Registry`]; a [`DeviceServer`] accepts
//! TLS/TCP client connections against it; an [`Advertiser`] rescans the same
//! registry on a timer and broadcasts UDP advertisements for what it finds.
//! Mirrors `device_server.py`'s `main()`: build the registry/discovery, spin
//! up the connection server and the advertising daemon as independent
//! long-lived tasks, then idle until shutdown.
//!
//! Exit codes follow spec §6: 0 on graceful shutdown, non-zero if config or
//! the TLS context can't be built.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use iot_device::advertise::{detect_local_ip, Advertiser};
use iot_device::discover::SerialScanner;
use iot_device::logging::init_tracing;
use iot_device::server::DeviceServer;
use iot_device::tls::server_tls_config;
use iot_device::{Config, Registry};
use tracing::info;

/// TLS-authenticated network bridge for serially-attached microcontroller REPLs.
#[derive(Parser, Debug)]
#[command(name = "iot_server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config.toml (defaults to $IOT49/config.toml or ~/.iot49/config.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable debug-level logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("loading configuration")?;

    let tls_config = server_tls_config(&config.cert_pem, &config.key_pem)
        .context("building TLS server context")?;

    let rt = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
    rt.block_on(run(config, tls_config));
    Ok(())
}

async fn run(config: Config, tls_config: Arc<rustls::ServerConfig>) {
    let registry = Arc::new(Registry::new());
    let local_ip = detect_local_ip();
    info!(%local_ip, port = config.connection_server_port, "starting device server");

    let server =
        Arc::new(DeviceServer::new(registry.clone(), config.password.clone(), tls_config));
    let server_port = config.connection_server_port;
    let server_task = tokio::spawn(async move {
        if let Err(e) = server.run(server_port).await {
            tracing::error!(error = %e, "device server stopped");
        }
    });

    let advertiser = Advertiser::new(
        registry,
        SerialScanner::default(),
        local_ip,
        config.advertise_port,
        config.connection_server_port,
        Duration::from_secs_f64(config.device_scan_interval),
    );
    let advertiser_task = tokio::spawn(advertiser.run());

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");
    server_task.abort();
    advertiser_task.abort();
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("installing SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {},
        _ = sigint.recv() => {},
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
