//! Tracing setup shared by the three binaries
//!
//! Matches `open-control-bridge::logging::init_tracing`: a compact
//! `fmt` layer plus an `EnvFilter`, initialized once at the top of
//! `main`. `RUST_LOG` overrides the level picked by `--verbose`.

/// Initialize the global tracing subscriber. `verbose` selects `debug`
/// as the default filter instead of `info`; `RUST_LOG` still wins if set.
pub fn init_tracing(verbose: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let default_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false).compact())
        .with(filter)
        .try_init();
}
