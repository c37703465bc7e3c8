//! Queue command - Inspect queues, dispatch jobs and run workers
//!
//! Usage:
//! ```bash
//! ferry queue list
//! ferry queue worker mail --max-jobs 100 --stop-when-empty
//! ferry queue clear mail
//! ferry queue send-mail ops@example.com "Nightly report" --body "All green"
//! ferry queue emit-event '{"user": 7}' --listener log --delay 30
//! ```

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, Table};
use std::time::Duration;
use tracing::warn;

use ferry_queue::jobs::{DispatchEventJob, SendMailJob};
use ferry_queue::{DispatchOptions, QueueWorker, WorkerConfig, DEFAULT_MAX_ATTEMPTS, DEFAULT_QUEUE};

use crate::app::{App, LOG_LISTENER};

/// Arguments for the queue command
#[derive(Args)]
pub struct QueueArgs {
    #[command(subcommand)]
    command: QueueCommand,
}

/// Where a dispatched job goes
#[derive(Args)]
struct DispatchArgs {
    /// Target queue
    #[arg(long, default_value = DEFAULT_QUEUE)]
    queue: String,

    /// Seconds before the job becomes available
    #[arg(long, default_value_t = 0)]
    delay: u64,

    /// Attempts before the job is failed for good
    #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS, value_parser = clap::value_parser!(u32).range(1..))]
    max_attempts: u32,
}

impl DispatchArgs {
    fn options(&self) -> DispatchOptions {
        DispatchOptions::on(self.queue.clone())
            .delay(self.delay)
            .max_attempts(self.max_attempts)
    }
}

#[derive(Subcommand)]
enum QueueCommand {
    /// List registered queues and their pending jobs
    #[command(name = "list")]
    List,

    /// Consume jobs from a queue
    #[command(name = "worker")]
    Worker {
        /// Queue to consume (`default` for the default queue)
        #[arg(default_value = DEFAULT_QUEUE)]
        name: String,

        /// Stop after processing this many jobs
        #[arg(long)]
        max_jobs: Option<u64>,

        /// Stop after running this many seconds
        #[arg(long)]
        max_runtime_secs: Option<u64>,

        /// Stop as soon as the queue is empty
        #[arg(long)]
        stop_when_empty: bool,
    },

    /// Delete every job in a queue
    #[command(name = "clear")]
    Clear {
        /// Queue to clear
        name: String,
    },

    /// Dispatch a mail job
    #[command(name = "send-mail")]
    SendMail {
        /// Recipient address
        to: String,

        /// Subject line
        subject: String,

        /// Message body
        #[arg(long, default_value = "")]
        body: String,

        #[command(flatten)]
        dispatch: DispatchArgs,
    },

    /// Dispatch an event to a named listener
    #[command(name = "emit-event")]
    EmitEvent {
        /// Event payload as JSON
        event: String,

        /// Listener that receives the event
        #[arg(long, default_value = LOG_LISTENER)]
        listener: String,

        #[command(flatten)]
        dispatch: DispatchArgs,
    },
}

/// Run the queue command
pub async fn run(args: QueueArgs, app: &App) -> Result<()> {
    match args.command {
        QueueCommand::List => list_queues(app).await,
        QueueCommand::Worker {
            name,
            max_jobs,
            max_runtime_secs,
            stop_when_empty,
        } => {
            let mut config = WorkerConfig::for_queue(name).poll_interval(app.config.poll_interval);
            if let Some(max) = max_jobs {
                config = config.max_jobs(max);
            }
            if let Some(secs) = max_runtime_secs {
                config = config.max_runtime(Duration::from_secs(secs));
            }
            if stop_when_empty {
                config = config.stop_when_empty();
            }
            run_worker(app, config).await
        }
        QueueCommand::Clear { name } => clear_queue(app, &name).await,
        QueueCommand::SendMail {
            to,
            subject,
            body,
            dispatch,
        } => {
            let job = SendMailJob { to, subject, body };
            let job_id = app
                .service
                .dispatch_with(&job, dispatch.options())
                .await
                .context("Failed to dispatch mail job")?;
            println!("{} Dispatched {} ({})", "✓".green().bold(), "send_mail".cyan(), job_id);
            Ok(())
        }
        QueueCommand::EmitEvent {
            event,
            listener,
            dispatch,
        } => {
            let event: serde_json::Value =
                serde_json::from_str(&event).with_context(|| format!("Invalid JSON: {event}"))?;
            let job_id = app
                .service
                .dispatch_with(&DispatchEventJob { listener, event }, dispatch.options())
                .await
                .context("Failed to dispatch event job")?;
            println!("{} Dispatched {} ({})", "✓".green().bold(), "dispatch_event".cyan(), job_id);
            Ok(())
        }
    }
}

async fn list_queues(app: &App) -> Result<()> {
    println!("{}", "Ferry Queues".bold().cyan());
    println!();

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Queue").fg(Color::Cyan),
            Cell::new("Backend").fg(Color::Cyan),
            Cell::new("Pending").fg(Color::Cyan),
        ]);

    for name in app.service.queue_names() {
        let pending = app
            .service
            .count(&name)
            .await
            .with_context(|| format!("Failed to count queue '{name}'"))?;
        let label = if app.service.default_queue_name() == Some(name.as_str()) {
            format!("{name} (default)")
        } else {
            name
        };

        table.add_row(vec![
            Cell::new(label).fg(Color::Green),
            Cell::new(app.config.backend.as_str()),
            Cell::new(pending).fg(if pending > 0 { Color::Yellow } else { Color::White }),
        ]);
    }

    println!("{table}");
    println!();
    println!("Start a worker: {}", "ferry queue worker <name>".green());
    Ok(())
}

async fn run_worker(app: &App, config: WorkerConfig) -> Result<()> {
    let queue = config.queue.clone();
    let mut worker = QueueWorker::new(app.service.clone(), config);

    let stop = worker.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current job");
            stop.stop();
        }
    });

    println!("{} Worker consuming '{}'...", "⚙".blue(), queue.green());
    let report = worker
        .run()
        .await
        .with_context(|| format!("Worker for queue '{queue}' stopped on a configuration error"))?;

    println!();
    println!("{}", "Worker finished:".bold());
    println!("  {} {}", "Processed:".dimmed(), report.processed);
    println!("  {} {}", "Succeeded:".dimmed(), report.succeeded.to_string().green());
    println!("  {} {}", "Failed:".dimmed(), report.failed.to_string().red());
    Ok(())
}

async fn clear_queue(app: &App, name: &str) -> Result<()> {
    app.service
        .clear(name)
        .await
        .with_context(|| format!("Failed to clear queue '{name}'"))?;
    println!("{} Cleared queue '{}'", "✓".green().bold(), name);
    Ok(())
}
