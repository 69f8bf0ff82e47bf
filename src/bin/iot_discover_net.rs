//! `iot_discover_net`: run the UDP advertisement scanner standalone.
//!
//! Mirrors `discover_net.py`'s `main()`: repeatedly listen for gateway
//! advertisements and report every newly-discovered device. Unlike
//! `iot_discover_serial`, each discovery here means a full TLS dial and
//! auth handshake against a remote `DeviceServer`, so a wrong `password` in
//! config shows up immediately as a scan that finds nothing.

use std::sync::Arc;

use clap::Parser;
use iot_device::discover::NetScanner;
use iot_device::logging::init_tracing;
use iot_device::{Config, Registry};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "iot_discover_net")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Scan once and exit instead of looping forever
    #[arg(long)]
    once: bool,

    /// Enable debug-level logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration");
            std::process::exit(1);
        }
    };

    let registry = Arc::new(Registry::new());
    let scanner = NetScanner::new(config.advertise_port, config.password.clone());

    loop {
        let before = registry.len();
        scanner.scan(&registry).await;
        if registry.len() > before {
            for device in registry.snapshot() {
                info!(uid = device.uid(), description = device.description(), "discovered net device");
            }
        }
        if cli.once {
            break;
        }
    }
}
