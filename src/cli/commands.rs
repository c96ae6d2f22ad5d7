//! CLI command definitions for jobforge.
//!
//! Provides a command for launching a server instance (fetcher + processor
//! pool + scheduled poller) against a Redis-compatible datastore.

use std::sync::Arc;

use clap::Parser;
use tracing::info;

use crate::config::Config;
use crate::datastore::RedisDatastore;
use crate::manager::Manager;
use crate::middleware::Chain;
use crate::registry::Registry;

/// Distributed background-job execution engine.
#[derive(Parser)]
#[command(name = "jobforge")]
#[command(about = "Run a jobforge server instance")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Start a server instance: fetcher, processor pool, and scheduled poller.
    Server(ServerArgs),
}

/// Arguments for the server command.
#[derive(Parser, Debug)]
pub struct ServerArgs {
    /// Redis-compatible datastore connection string.
    #[arg(long, env = "JOBFORGE_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Number of processors to run.
    #[arg(short = 'c', long, env = "JOBFORGE_CONCURRENCY", default_value = "10")]
    pub concurrency: usize,

    /// Ordered, comma-separated queue list.
    #[arg(short = 'q', long, env = "JOBFORGE_QUEUES", default_value = "default", value_delimiter = ',')]
    pub queues: Vec<String>,

    /// Strict-order fetch (true) or weighted-random (false).
    #[arg(long, env = "JOBFORGE_STRICT", default_value = "true")]
    pub strict: bool,

    /// Default attempt cap for jobs that don't declare their own.
    #[arg(long, env = "JOBFORGE_MAX_RETRIES", default_value = "25")]
    pub max_retries: u32,

    /// Shutdown hard-timeout in seconds.
    #[arg(long, env = "JOBFORGE_SHUTDOWN_TIMEOUT_SECS", default_value = "25")]
    pub shutdown_timeout_secs: u64,

    /// Process identity prefix (defaults to hostname-pid if unset).
    #[arg(long)]
    pub identity: Option<String>,
}

/// Parses CLI arguments from `std::env::args()`.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Top-level entry point used by `main`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Runs the parsed CLI, dispatching to the matched subcommand.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Server(args) => run_server(args).await,
    }
}

async fn run_server(args: ServerArgs) -> anyhow::Result<()> {
    let config = Config {
        concurrency: args.concurrency,
        queues: args.queues,
        strict: args.strict,
        max_retries: args.max_retries,
        shutdown_timeout: std::time::Duration::from_secs(args.shutdown_timeout_secs),
        redis_url: args.redis_url.clone(),
        ..Config::default()
    };

    let identity = args
        .identity
        .unwrap_or_else(|| format!("{}-{}", hostname(), std::process::id()));

    crate::metrics::init_metrics().map_err(|e| anyhow::anyhow!("metrics init failed: {e}"))?;

    let datastore = Arc::new(RedisDatastore::connect(&args.redis_url).await?);
    let registry = Arc::new(Registry::new());
    let middleware = Chain::new();

    let mut manager = Manager::new(config, identity.clone(), datastore, registry, middleware);
    manager.start().await?;
    info!(identity = %identity, "jobforge server started");

    tokio::select! {
        _ = manager.run_event_loop() => {}
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("shutdown signal received");
        }
    }
    manager.shutdown().await;

    Ok(())
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "jobforge".to_string())
}
