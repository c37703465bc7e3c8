//! Task command - Run named maintenance tasks with retries
//!
//! Usage:
//! ```bash
//! ferry task list
//! ferry task run prune-completed --max-attempts 3 --backoff 5
//! ```

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, Table};

use ferry_queue::RetryRunner;

use crate::app::App;

/// Arguments for the task command
#[derive(Args)]
pub struct TaskArgs {
    #[command(subcommand)]
    command: TaskCommand,
}

#[derive(Subcommand)]
enum TaskCommand {
    /// List registered tasks
    #[command(name = "list")]
    List,

    /// Run a task, retrying on failure
    #[command(name = "run")]
    Run {
        /// Name of the task
        name: String,

        /// Total attempts, at least 1
        #[arg(long, default_value = "1", allow_hyphen_values = true)]
        max_attempts: String,

        /// Seconds to wait between attempts
        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        backoff: String,
    },
}

/// Run the task command
pub async fn run(args: TaskArgs, app: &App) -> Result<()> {
    match args.command {
        TaskCommand::List => list_tasks(app),
        TaskCommand::Run {
            name,
            max_attempts,
            backoff,
        } => {
            // Validated before the task is looked up or started
            let runner = RetryRunner::parse(&max_attempts, &backoff)?;

            println!("{} Running task '{}'...", "⚙".blue(), name.green());
            app.tasks
                .run(&name, &runner)
                .await
                .with_context(|| format!("Task '{name}' did not complete"))?;
            println!("{} Task '{}' completed", "✓".green().bold(), name);
            Ok(())
        }
    }
}

fn list_tasks(app: &App) -> Result<()> {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Task").fg(Color::Cyan),
            Cell::new("Description").fg(Color::Cyan),
        ]);

    for task in app.tasks.tasks() {
        table.add_row(vec![
            Cell::new(task.name()).fg(Color::Green),
            Cell::new(task.description()),
        ]);
    }

    println!("{table}");
    println!();
    println!("Run a task: {}", "ferry task run <name> [--max-attempts N] [--backoff S]".green());
    Ok(())
}
