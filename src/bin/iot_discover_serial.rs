//! `iot_discover_serial`: run the serial scanner standalone.
//!
//! Mirrors `discover_serial.py`'s `main()`: repeatedly scan local serial
//! ports, and for every device that answered recently, read back its RTC
//! and sync it against the host clock. Useful on its own for checking which
//! boards are visible on a machine before starting the full device server.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use iot_device::discover::SerialScanner;
use iot_device::logging::init_tracing;
use iot_device::repl::Session;
use iot_device::sync::host_local_time_now;
use iot_device::Registry;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "iot_discover_serial")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Scan once and exit instead of looping forever
    #[arg(long)]
    once: bool,

    /// Seconds between scans
    #[arg(long, default_value_t = 3.0)]
    interval: f64,

    /// Enable debug-level logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let registry = Arc::new(Registry::new());
    let scanner = SerialScanner::default();
    let interval = Duration::from_secs_f64(cli.interval);

    loop {
        scanner.scan(&registry).await;

        for device in registry.snapshot() {
            if device.age() > Duration::from_secs(1) {
                info!(uid = device.uid(), age_secs = device.age().as_secs_f64(), "skipping stale device");
                continue;
            }
            let mut session = device.acquire().await;
            let mut repl = Session::new(&mut session);
            match repl.get_time().await {
                Ok(before) => {
                    info!(uid = repl.uid(), ?before, "device time before sync");
                    if let Err(e) = repl.sync_time_default(host_local_time_now()).await {
                        warn!(uid = repl.uid(), error = %e, "sync_time failed");
                        continue;
                    }
                    match repl.get_time().await {
                        Ok(after) => info!(uid = repl.uid(), ?after, "device time after sync"),
                        Err(e) => warn!(uid = repl.uid(), error = %e, "get_time failed after sync"),
                    }
                }
                Err(e) => warn!(uid = repl.uid(), error = %e, "get_time failed"),
            }
        }

        if cli.once {
            break;
        }
        tokio::time::sleep(interval).await;
    }
}
