//! Info command - Show configuration and registered handlers
//!
//! Usage:
//! ```bash
//! ferry info
//! ```

use anyhow::Result;
use clap::Args;
use colored::Colorize;

use ferry_queue::jobs::{DispatchEventJob, SendMailJob};
use ferry_queue::Job;

use crate::app::App;

/// Arguments for the info command
#[derive(Args)]
pub struct InfoArgs;

/// Run the info command
pub fn run(_args: InfoArgs, app: &App) -> Result<()> {
    let version = env!("CARGO_PKG_VERSION");
    let config = &app.config;

    println!("{}", "Ferry - background jobs".bold().cyan());
    println!("{}", "═".repeat(40).cyan());
    println!();

    println!("{}", "Version:".bold());
    println!("  {} {}", "CLI Version:".dimmed(), version.green());
    println!();

    println!("{}", "Configuration:".bold());
    println!("  {} {}", "Backend:".dimmed(), config.backend.as_str().green());
    if let Some(window) = config.stale_reservation {
        println!("  {} {}s", "Stale reservations after:".dimmed(), window.as_secs());
    }
    println!("  {} {:?}", "Poll interval:".dimmed(), config.poll_interval);
    println!();

    println!("{}", "Queues:".bold());
    for name in app.service.queue_names() {
        let marker = if name == config.default_queue { " (default)" } else { "" };
        println!("  {} {}{}", "•".cyan(), name.green(), marker.dimmed());
    }
    println!();

    println!("{}", "Job types:".bold());
    for job_type in [SendMailJob::JOB_TYPE, DispatchEventJob::JOB_TYPE] {
        println!("  {} {}", "•".cyan(), job_type.green());
    }
    println!();

    println!("{}", "Tasks:".bold());
    for name in app.tasks.names() {
        println!("  {} {}", "•".cyan(), name.green());
    }

    Ok(())
}
