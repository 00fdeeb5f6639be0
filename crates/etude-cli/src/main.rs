use anyhow::Context;
use clap::Parser;
use etude_core::{Server, ServerConfig, logging};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "etude")]
#[command(about = "Static-file HTTP/1.1 server on an edge-triggered epoll loop")]
#[command(version)]
struct Cli {
    /// Port to listen on (overrides ETUDE_PORT)
    port: Option<u16>,

    /// Worker threads (overrides ETUDE_WORKERS)
    threads: Option<usize>,

    /// Listen host (overrides ETUDE_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Directory to serve (overrides ETUDE_DOCUMENT_ROOT)
    #[arg(long)]
    root: Option<PathBuf>,

    /// Jobs allowed to wait for a worker (overrides ETUDE_QUEUE_CAPACITY)
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Live connection limit (overrides ETUDE_MAX_CONNECTIONS)
    #[arg(long)]
    max_connections: Option<usize>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn apply(self, mut config: ServerConfig) -> ServerConfig {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(threads) = self.threads {
            config.workers = threads;
        }
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(root) = self.root {
            config.document_root = root;
        }
        if let Some(cap) = self.queue_capacity {
            config.queue_capacity = cap;
        }
        if let Some(max) = self.max_connections {
            config.max_connections = max;
        }
        config
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli.json_logs {
        logging::init_logging_json();
    } else {
        logging::init_logging();
    }

    let config = cli.apply(ServerConfig::from_env().context("loading configuration")?);
    let server = Server::bind(config).context("starting server")?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        info!("Received SIGINT. Initiating graceful shutdown...");
        flag.store(true, Ordering::Release);
    })
    .context("installing Ctrl-C handler")?;

    server.run(shutdown)?;
    Ok(())
}
