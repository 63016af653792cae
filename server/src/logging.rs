//! Logging setup.
//!
//! Builds the process-wide subscriber from the `[logging]` config
//! section. The level acts as a default; a `RUST_LOG` environment filter
//! takes precedence when present.

use crate::config::LoggingConfig;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the global subscriber from configuration.
pub fn init(config: &LoggingConfig) {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(env_filter) => env_filter,
        Err(_) => EnvFilter::new(&config.level),
    };
    let registry = tracing_subscriber::registry().with(filter);

    // "pretty" and anything unrecognized use the default layer.
    if config.format == "json" {
        registry.with(fmt::layer().json()).init();
    } else if config.format == "compact" {
        registry.with(fmt::layer().compact()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}
