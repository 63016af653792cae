//! Logging setup.
//!
//! One global subscriber for the whole process: an `EnvFilter` built from
//! the configured level (a `RUST_LOG` in the environment wins) under a
//! fmt layer in the configured format.

use crate::config::LoggingConfig;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the global subscriber from configuration.
pub fn init(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let registry = tracing_subscriber::registry().with(filter);

    // Unknown formats fall back to the default human-readable layer.
    match config.format.as_str() {
        "json" => registry.with(fmt::layer().json()).init(),
        "compact" => registry.with(fmt::layer().compact()).init(),
        _ => registry.with(fmt::layer()).init(),
    }
}
