//! Ferry CLI - run workers, inspect queues and run maintenance tasks
//!
//! # Usage
//!
//! ```bash
//! # Show queues and their pending jobs
//! FERRY_BACKEND=sqlite FERRY_DATABASE_URL=sqlite:ferry.db \
//!     FERRY_STALE_RESERVATION_SECS=300 ferry queue list
//!
//! # Work the default queue until it is empty
//! ferry queue worker default --stop-when-empty
//!
//! # Run a task with up to 3 attempts, 5 seconds apart
//! ferry task run prune-completed --max-attempts 3 --backoff 5
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

mod app;
mod commands;
mod config;

use app::App;
use commands::{info, queue, task};
use config::FerryConfig;

/// Ferry - background jobs for Rust services
///
/// Queues and workers are configured through FERRY_* environment variables.
#[derive(Parser)]
#[command(
    name = "ferry",
    version,
    about = "Ferry CLI - queues, workers and tasks",
    long_about = "Ferry runs background jobs from in-memory, SQLite or PostgreSQL queues.\n\n\
                  Configure it with FERRY_BACKEND, FERRY_DATABASE_URL, FERRY_QUEUES,\n\
                  FERRY_DEFAULT_QUEUE and FERRY_STALE_RESERVATION_SECS."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue inspection, dispatch and workers
    #[command(name = "queue")]
    Queue(queue::QueueArgs),

    /// Named maintenance tasks
    #[command(name = "task")]
    Task(task::TaskArgs),

    /// Show configuration
    #[command(name = "info")]
    Info(info::InfoArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup tracing based on verbosity
    setup_logging(cli.verbose);

    let config = FerryConfig::from_env().context("Failed to load configuration")?;
    let app = App::build(config).await?;

    match cli.command {
        Commands::Queue(args) => queue::run(args, &app).await,
        Commands::Task(args) => task::run(args, &app).await,
        Commands::Info(args) => info::run(args, &app),
    }
}

/// Setup logging based on verbosity level
fn setup_logging(verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();
}
