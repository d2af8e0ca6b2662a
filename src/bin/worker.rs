//! # dispatch-worker — queue consumer for one backend
//!
//! Runs N consumption loops against the shared Redis queue for either the
//! GPU or the API backend.
//!
//! ## Usage
//!
//! ```bash
//! # GPU worker next to the local inference server
//! dispatch-worker --backend gpu --config dispatch.toml
//!
//! # Three API workers
//! dispatch-worker --backend api --concurrency 3 --config dispatch.toml
//! ```
//!
//! On startup the worker requeues deliveries a previous run of the same
//! consumer id left unacknowledged. The GPU variant also publishes GPU
//! liveness every heartbeat interval and withdraws it on Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use inference_dispatch::availability::spawn_heartbeat;
use inference_dispatch::config::loader;
use inference_dispatch::runtime::{build_backend, consumer_id, Components};
use inference_dispatch::{init_tracing_with_format, metrics, BackendKind};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Parsed CLI arguments.
struct Args {
    /// Which queue to consume.
    backend: BackendKind,
    /// Loop count; `None` uses the config value.
    concurrency: Option<usize>,
    /// Optional TOML config file.
    config: Option<PathBuf>,
}

/// Parse command-line arguments manually (no external arg parser dependency).
///
/// # Returns
///
/// - `Ok(Args)` on success
/// - `Err(String)` with a usage message on failure
fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut backend = None;
    let mut concurrency = None;
    let mut config = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--backend" | "-b" => {
                i += 1;
                if i >= args.len() {
                    return Err("--backend requires a value".to_string());
                }
                backend = Some(
                    args[i]
                        .parse::<BackendKind>()
                        .map_err(|_| format!("invalid backend: {} (expected gpu or api)", args[i]))?,
                );
            }
            "--concurrency" | "-n" => {
                i += 1;
                if i >= args.len() {
                    return Err("--concurrency requires a value".to_string());
                }
                let n: usize = args[i]
                    .parse()
                    .map_err(|_| format!("invalid concurrency: {}", args[i]))?;
                if n == 0 {
                    return Err("--concurrency must be at least 1".to_string());
                }
                concurrency = Some(n);
            }
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

    let backend = backend.ok_or_else(|| format!("--backend is required\n{}", usage()))?;
    Ok(Args {
        backend,
        concurrency,
        config,
    })
}

/// Print usage information.
fn usage() -> String {
    [
        "Usage: dispatch-worker --backend <gpu|api> [OPTIONS]",
        "",
        "Options:",
        "  --backend, -b <KIND>      Queue to consume: gpu or api",
        "  --concurrency, -n <N>     Consumption loops (default: from config)",
        "  --config, -c <FILE>       TOML config file (default: built-in defaults)",
        "  --help, -h                Show this help message",
    ]
    .join("\n")
}

#[tokio::main]
async fn main() {
    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };

    if let Err(e) = run(args).await {
        error!(error = %e, "dispatch-worker failed");
        eprintln!("dispatch-worker: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = loader::load(args.config.as_deref())?;
    let _ = init_tracing_with_format(config.observability.log_format.as_str());
    metrics::init_metrics()?;

    let kind = args.backend;
    let worker_id = format!("{}-{kind}", consumer_id(&config)?);
    let components = Components::build(&config, &worker_id)?;
    if components.is_in_process() {
        return Err("dispatch-worker needs storage.backend = \"redis\"; \
                    memory storage runs workers inside dispatch-api"
            .into());
    }

    let backend = build_backend(
        config.backends.for_backend(kind),
        config.workers.timeout_for(kind),
    )?;
    let worker = Arc::new(components.worker(&config, kind, worker_id.clone(), backend.clone()));
    let concurrency = args
        .concurrency
        .unwrap_or_else(|| config.workers.concurrency_for(kind));

    info!(
        backend = %kind,
        worker_id = %worker_id,
        concurrency,
        queue = worker.queue_name(),
        "Starting dispatch-worker"
    );

    match components.queue.recover_unacked(worker.queue_name()).await {
        Ok(0) => {}
        Ok(n) => info!(recovered = n, queue = worker.queue_name(), "requeued unacknowledged deliveries"),
        Err(e) => warn!(error = %e, "could not recover unacknowledged deliveries"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    if kind == BackendKind::Gpu {
        handles.push(spawn_heartbeat(
            components.availability.clone(),
            backend,
            worker_id.clone(),
            Duration::from_secs(config.workers.heartbeat_interval_s),
            shutdown_rx.clone(),
        ));
    }
    handles.extend(worker.spawn_pool(concurrency, shutdown_rx));

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    info!("Shutdown signal received, draining workers");
    let _ = shutdown_tx.send(true);

    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            warn!(error = %e, "worker task ended abnormally");
        }
    }

    info!(backend = %kind, "dispatch-worker stopped");
    Ok(())
}
