//! # dispatch-api — HTTP admission server
//!
//! Serves the chat submission and status endpoints. With
//! `storage.backend = "memory"` the GPU and API workers run in this process
//! too; with `"redis"` they run as separate `dispatch-worker` processes.
//!
//! ## Usage
//!
//! ```bash
//! dispatch-api --config dispatch.toml
//! ```
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json` — structured JSON output (production)
//! - `RUST_LOG=info` — log level filter
//! - `REDIS_URL`, `HOST`, `PORT` — override the config file

use std::path::PathBuf;

use inference_dispatch::config::loader;
use inference_dispatch::runtime::{consumer_id, Components, EmbeddedWorkers};
use inference_dispatch::web_api::{start_server_with_shutdown, ServerConfig};
use inference_dispatch::{init_tracing_with_format, metrics};
use tracing::{error, info};

/// Parsed CLI arguments.
struct Args {
    /// Optional TOML config file.
    config: Option<PathBuf>,
}

fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                if i >= args.len() {
                    return Err("--config requires a value".to_string());
                }
                config = Some(PathBuf::from(&args[i]));
            }
            "--help" | "-h" => return Err(usage()),
            other => return Err(format!("unknown argument: {other}\n{}", usage())),
        }
        i += 1;
    }

    Ok(Args { config })
}

fn usage() -> String {
    [
        "Usage: dispatch-api [OPTIONS]",
        "",
        "Options:",
        "  --config, -c <FILE>   TOML config file (default: built-in defaults)",
        "  --help, -h            Show this help message",
    ]
    .join("\n")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };

    let config = loader::load(args.config.as_deref())?;
    let _ = init_tracing_with_format(config.observability.log_format.as_str());
    metrics::init_metrics()?;

    let node_id = consumer_id(&config)?;
    info!(
        node_id = %node_id,
        storage = ?config.storage.backend,
        "Starting dispatch-api"
    );

    let components = Components::build(&config, &node_id)?;
    let workers = if components.is_in_process() {
        Some(EmbeddedWorkers::spawn(&config, &components, &node_id)?)
    } else {
        None
    };

    let admission = components.admission(&config);
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for shutdown signal");
        }
        info!("Shutdown signal received");
    };

    let served =
        start_server_with_shutdown(ServerConfig::from(&config.server), admission, shutdown).await;

    if let Some(workers) = workers {
        workers.shutdown().await;
    }

    served
}
