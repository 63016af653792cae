//! Ferry proxy binary.

use clap::Parser;
use proxy::config::{CacheConfig, LoggingConfig, ProxyConfig, RemoteConfig};
use proxy::{CacheStore, Config};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "ferry-proxy")]
#[command(about = "Client-side caching file proxy")]
struct Args {
    /// Remote file server host or IP
    server_ip: Option<String>,

    /// Remote file server port
    port: Option<u16>,

    /// Cache directory
    cache_dir: Option<PathBuf>,

    /// Cache capacity in bytes
    cache_size: Option<u64>,

    /// Load configuration from a TOML file instead of positional arguments
    #[arg(long, conflicts_with_all = ["server_ip", "port", "cache_dir", "cache_size"])]
    config: Option<PathBuf>,

    /// Address to listen on for client connections
    #[arg(long)]
    listen: Option<SocketAddr>,
}

fn main() {
    let args = Args::parse();

    let mut config = match build_config(&args) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("{message}");
            eprintln!("Usage: ferry-proxy <server_ip> <port> <cache_dir> <cache_size>");
            std::process::exit(1);
        }
    };
    if let Some(listen) = args.listen {
        config.proxy.listen = listen;
    }

    proxy::logging::init(&config.logging);

    if let Err(e) = std::fs::create_dir_all(&config.cache.dir) {
        tracing::error!(dir = %config.cache.dir.display(), error = %e, "cannot create cache directory");
        std::process::exit(1);
    }

    let store = Arc::new(CacheStore::new(config.cache.max_size_bytes));
    let shutdown = proxy::signal::install_signal_handler();

    if let Err(e) = proxy::run(&config, store, shutdown) {
        tracing::error!(error = %e, "proxy error");
        std::process::exit(1);
    }
}

fn build_config(args: &Args) -> Result<Config, String> {
    if let Some(path) = &args.config {
        return Config::load(path).map_err(|e| format!("Failed to load config: {e}"));
    }

    match (
        &args.server_ip,
        args.port,
        &args.cache_dir,
        args.cache_size,
    ) {
        (Some(host), Some(port), Some(dir), Some(size)) => Ok(Config {
            proxy: ProxyConfig::default(),
            remote: RemoteConfig {
                host: host.clone(),
                port,
            },
            cache: CacheConfig {
                dir: dir.clone(),
                max_size_bytes: size,
            },
            logging: LoggingConfig::default(),
        }),
        _ => Err("Missing arguments".to_string()),
    }
}
