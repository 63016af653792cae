//! Ferry file server binary.

use clap::Parser;
use server::config::{LoggingConfig, ServerConfig, StorageConfig};
use server::{Config, ServerFiles};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "ferry-server")]
#[command(about = "File server for the ferry caching proxy")]
struct Args {
    /// Port to listen on
    port: Option<u16>,

    /// Root directory all served files live under
    root_dir: Option<PathBuf>,

    /// Load configuration from a TOML file instead of positional arguments
    #[arg(long, conflicts_with_all = ["port", "root_dir"])]
    config: Option<PathBuf>,
}

fn main() {
    let args = Args::parse();

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("{message}");
            eprintln!("Usage: ferry-server <port> <root_dir>");
            std::process::exit(1);
        }
    };

    server::logging::init(&config.logging);

    if let Err(e) = std::fs::create_dir_all(&config.storage.root_dir) {
        tracing::error!(
            dir = %config.storage.root_dir.display(),
            error = %e,
            "cannot create root directory"
        );
        std::process::exit(1);
    }

    let files = Arc::new(ServerFiles::new(config.storage.root_dir.clone()));
    let shutdown = server::signal::install_signal_handler();

    if let Err(e) = server::run(&config, files, shutdown) {
        tracing::error!(error = %e, "server error");
        std::process::exit(1);
    }
}

fn build_config(args: &Args) -> Result<Config, String> {
    if let Some(path) = &args.config {
        return Config::load(path).map_err(|e| format!("Failed to load config: {e}"));
    }

    match (args.port, &args.root_dir) {
        (Some(port), Some(root_dir)) => Ok(Config {
            server: ServerConfig {
                listen: SocketAddr::from(([0, 0, 0, 0], port)),
            },
            storage: StorageConfig {
                root_dir: root_dir.clone(),
            },
            logging: LoggingConfig::default(),
        }),
        _ => Err("Missing arguments".to_string()),
    }
}
