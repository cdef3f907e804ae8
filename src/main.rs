//! fastrpc: JSON-RPC 2.0 over FastCGI
//!
//! Sits behind a FastCGI-capable web server and answers one JSON-RPC
//! request per connection from a bounded pool of worker threads.
//!
//! Usage:
//!   fastrpc --socket /run/fastrpc.sock                 # Unix socket, system service
//!   fastrpc --socket 127.0.0.1:9000 --threads 8        # TCP, eight workers
//!   fastrpc --socket :9000 --queue-capacity 0          # all interfaces, unbounded queue
//!   FASTRPC_SOCKET=/tmp/rpc.sock fastrpc --log-json    # configured from the environment

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use fastrpc_server::{Server, ServerConfig, config};
use fastrpc_services::{ServiceFactory, SystemService, TableFactory};
use fastrpc_transport::ListenAddress;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fastrpc", version, about = "JSON-RPC 2.0 server over FastCGI")]
struct Cli {
    /// Unix socket path or `host:port` to listen on
    #[arg(long, env = "FASTRPC_SOCKET")]
    socket: ListenAddress,

    /// Worker threads (0 for one per core)
    #[arg(long, env = "FASTRPC_THREADS", default_value_t = 0)]
    threads: usize,

    /// Requests allowed to wait for a worker (0 for no limit)
    #[arg(long, env = "FASTRPC_QUEUE_CAPACITY", default_value_t = config::DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,

    /// Largest accepted request body in bytes
    #[arg(long, env = "FASTRPC_MAX_REQUEST_SIZE", default_value_t = config::DEFAULT_MAX_REQUEST_SIZE)]
    max_request_size: usize,

    /// Per-request deadline in seconds (0 to disable)
    #[arg(
        long,
        env = "FASTRPC_REQUEST_TIMEOUT_SECS",
        default_value_t = config::DEFAULT_REQUEST_TIMEOUT.as_secs()
    )]
    request_timeout_secs: u64,

    /// Service answering requests
    #[arg(long, env = "FASTRPC_SERVICE", value_enum, default_value_t = ServiceKind::System)]
    service: ServiceKind,

    /// Enable verbose logging
    #[arg(long, env = "FASTRPC_VERBOSE")]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "FASTRPC_LOG_JSON")]
    log_json: bool,

    /// Append logs to a file instead of stderr
    #[arg(long, env = "FASTRPC_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ServiceKind {
    /// Liveness and diagnostics methods (`ping`, `echo`, `sum`, ...)
    System,
}

impl Cli {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            threads: self.threads,
            queue_capacity: (self.queue_capacity > 0).then_some(self.queue_capacity),
            max_request_size: self.max_request_size,
            request_timeout: (self.request_timeout_secs > 0)
                .then(|| Duration::from_secs(self.request_timeout_secs)),
        }
    }
}

fn init_tracing(cli: &Cli) -> Result<()> {
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match (&cli.log_file, cli.log_json) {
        (Some(path), json) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            let builder = builder
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false);
            if json {
                builder.json().init();
            } else {
                builder.init();
            }
            eprintln!("Logging to {}", path.display());
        }
        (None, true) => builder.json().init(),
        (None, false) => builder.init(),
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;

    let config = cli.server_config();
    match cli.service {
        ServiceKind::System => {
            let factory = TableFactory::<SystemService>::new()
                .context("Failed to register the system service")?;
            serve(config, factory, &cli.socket)
        }
    }
}

/// Start the runtime, bind and run the accept loop on this thread until
/// Ctrl-C. A Unix socket file is removed when the listener is dropped.
fn serve<F: ServiceFactory>(config: ServerConfig, factory: F, address: &ListenAddress) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads())
        .thread_name("fastrpc-worker")
        .enable_all()
        .build()
        .context("Failed to build the tokio runtime")?;
    let server = Server::new(config, factory);

    runtime.block_on(async {
        let listener = server
            .bind(address)
            .with_context(|| format!("Failed to listen on {address}"))?;
        info!("fastrpc listening on {address}");

        server
            .run(listener, async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for Ctrl-C: {e}");
                    std::future::pending::<()>().await;
                }
            })
            .await;
        Ok::<_, anyhow::Error>(())
    })
}
