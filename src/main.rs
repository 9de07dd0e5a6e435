use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use winlink::config::{Config, LoggingConfig, WorkerEndpoint};
use winlink::node::{MasterNode, WorkerNode};
use winlink::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "winlink")]
#[command(version)]
#[command(about = "Distributed task execution with priority scheduling and load balancing")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the master: scheduler, worker connections and HTTP API
    Master(MasterArgs),

    /// Run a worker that executes tasks for a master
    Worker(WorkerArgs),
}

#[derive(Parser, Debug)]
struct MasterArgs {
    /// JSON configuration file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Worker to connect to, as id@host:port (repeatable)
    #[arg(long = "worker", value_name = "ID@HOST:PORT")]
    workers: Vec<WorkerEndpoint>,

    /// Port for the HTTP API (overrides network.master_port)
    #[arg(long)]
    api_port: Option<u16>,

    /// Do not start the HTTP API
    #[arg(long)]
    no_api: bool,
}

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// JSON configuration file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Port to listen on for the master (overrides network.worker_port)
    #[arg(long)]
    port: Option<u16>,

    /// Worker id announced to the master (defaults to the host name)
    #[arg(long)]
    worker_id: Option<String>,

    /// Capability tag offered to the scheduler (repeatable)
    #[arg(long = "capability", value_name = "TAG")]
    capabilities: Vec<String>,

    /// Tasks executed at the same time
    #[arg(long)]
    max_concurrent_tasks: Option<u32>,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run_master(args: MasterArgs) -> anyhow::Result<()> {
    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.logging);

    if let Some(port) = args.api_port {
        config.network.master_port = port;
    }
    config.network.workers.extend(args.workers);

    let shutdown = install_shutdown_handler().context("Failed to install signal handlers")?;

    let api = if args.no_api {
        None
    } else {
        let addr = format!("{}:{}", config.network.bind_host, config.network.master_port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind HTTP API on {}", addr))?;
        Some(listener)
    };

    tracing::info!(
        tls_enabled = config.security.tls.enabled,
        workers = ?config
            .network
            .workers
            .iter()
            .map(|w| format!("{}@{}", w.worker_id, w.address))
            .collect::<Vec<_>>(),
        "Starting winlink master"
    );

    let (node, events) = MasterNode::from_config(config, shutdown)?;
    node.run(events, api).await;
    Ok(())
}

async fn run_worker(args: WorkerArgs) -> anyhow::Result<()> {
    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.logging);

    if let Some(port) = args.port {
        config.network.worker_port = port;
    }
    if let Some(max) = args.max_concurrent_tasks {
        config.executor.max_concurrent_tasks = max;
    }
    config.executor.capabilities.extend(args.capabilities);
    config.validate()?;

    let worker_id = args
        .worker_id
        .or_else(|| config.network.worker_id.clone())
        .or_else(sysinfo::System::host_name)
        .unwrap_or_else(|| "worker".to_string());

    let shutdown = install_shutdown_handler().context("Failed to install signal handlers")?;

    let addr = format!("{}:{}", config.network.bind_host, config.network.worker_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind worker listener on {}", addr))?;

    tracing::info!(
        worker_id = %worker_id,
        addr = %addr,
        tls_enabled = config.security.tls.enabled,
        "Starting winlink worker"
    );
    WorkerNode::serve(&config, worker_id, listener, shutdown).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Master(args) => run_master(args).await,
        Commands::Worker(args) => run_worker(args).await,
    }
}
