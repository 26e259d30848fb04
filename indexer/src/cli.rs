//! Command-line arguments.

use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(ClapArgs, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Directory for cached external responses
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Directory for logs and other run state
    #[arg(long, global = true)]
    pub run_dir: Option<PathBuf>,

    /// Chunk size for bulk pointer reads
    #[arg(long, global = true)]
    pub batch_size: Option<usize>,

    /// SQLite connection URL
    #[arg(long, global = true)]
    pub database_url: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Scheduler entry points
    Scheduler {
        #[command(subcommand)]
        command: SchedulerCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum SchedulerCommand {
    /// Run a collector over a range immediately, without the job queue
    Manual {
        collector: String,
        #[arg(long, value_parser = parse_datetime)]
        start_date: DateTime<Utc>,
        #[arg(long, value_parser = parse_datetime)]
        end_date: DateTime<Utc>,
    },
    /// Drain the pending jobs of a group
    Worker { group: String },
    /// Queue jobs for every uncovered range through the base date
    Queue {
        /// Defaults to now
        #[arg(value_parser = parse_datetime)]
        base_date: Option<DateTime<Utc>>,
    },
    /// Queue one ad-hoc job for a collector
    CreateJob {
        collector: String,
        #[arg(long, value_parser = parse_datetime)]
        base_date: DateTime<Utc>,
        #[arg(long, value_parser = parse_datetime)]
        start_date: DateTime<Utc>,
        #[arg(long, value_parser = parse_datetime)]
        end_date: DateTime<Utc>,
    },
}

/// Accepts RFC 3339 date-times and bare `YYYY-MM-DD` dates (00:00 UTC).
pub fn parse_datetime(value: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| format!("invalid date '{value}', expected YYYY-MM-DD or RFC 3339"))
}
