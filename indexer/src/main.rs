mod cli;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use date_range::Range;
use std::process;
use std::sync::Arc;
use tracing::{error, info, warn};

use cli::{Args, Commands, GlobalArgs, SchedulerCommand};
use oso_indexer::collector::github;
use oso_indexer::config::IndexerConfig;
use oso_indexer::scheduler::{GithubWorkerSpawner, Scheduler};
use oso_indexer::utils::http_client::{ThrottledClient, install_rustls_provider};
use oso_indexer::{database, logging};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    match run(args).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!("Application error: {:#}", e);
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    }
}

fn load_config(global: &GlobalArgs) -> anyhow::Result<IndexerConfig> {
    let mut config = IndexerConfig::from_env()?;
    if let Some(dir) = &global.cache_dir {
        config.cache_dir = dir.clone();
    }
    if let Some(dir) = &global.run_dir {
        config.run_dir = dir.clone();
    }
    if let Some(size) = global.batch_size {
        config.batch_size = size;
    }
    if let Some(url) = &global.database_url {
        config.database_url = url.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn build_scheduler(config: Arc<IndexerConfig>) -> anyhow::Result<Scheduler> {
    let pool = database::connect(&config.database_url)
        .await
        .with_context(|| format!("opening database {}", config.database_url))?;

    let mut scheduler = Scheduler::from_pool(config.clone(), pool);
    scheduler.register_collector(github::descriptor())?;

    if let Some(target) = &config.dispatch {
        let client = ThrottledClient::from_token(
            config.github_token.as_deref(),
            config.github_api_url.clone(),
            config.rate_limit.clone(),
        )?;
        scheduler = scheduler.with_spawner(Arc::new(GithubWorkerSpawner::new(
            client,
            target.clone(),
        )));
    }

    Ok(scheduler)
}

async fn run(args: Args) -> anyhow::Result<i32> {
    let config = load_config(&args.global)?;
    let log_dir = config.log_dir();
    let _guard = logging::init_logging(Some(log_dir.as_path()))?;
    install_rustls_provider();

    let config = Arc::new(config);
    let scheduler = build_scheduler(config).await?;

    let Commands::Scheduler { command } = args.command;
    match command {
        SchedulerCommand::Manual {
            collector,
            start_date,
            end_date,
        } => {
            let range = Range::new(start_date, end_date)?;
            scheduler.execute_for_range(&collector, range).await?;
            info!(collector = %collector, %range, "Manual run finished");
        }
        SchedulerCommand::Worker { group } => {
            let failures = scheduler.run_worker(&group).await?;
            if !failures.is_empty() {
                for failure in &failures {
                    error!(
                        job_id = %failure.job_id,
                        collector = %failure.collector,
                        artifact_id = ?failure.artifact_id,
                        "{}",
                        failure.error
                    );
                }
                return Ok(1);
            }
        }
        SchedulerCommand::Queue { base_date } => {
            let base_date = base_date.unwrap_or_else(Utc::now);
            let summary = scheduler.queue_all(base_date).await?;
            for failure in &summary.dispatch_failures {
                warn!(group = %failure.group, "Worker dispatch failed: {}", failure.error);
            }
            info!(
                created = summary.created_count(),
                already_queued = summary.already_queued,
                dispatched = summary.dispatched.len(),
                "Queue pass finished"
            );
        }
        SchedulerCommand::CreateJob {
            collector,
            base_date,
            start_date,
            end_date,
        } => {
            let range = Range::new(start_date, end_date)?;
            let job = scheduler
                .queue_job(&collector, base_date, range)
                .await?;
            println!("{}", job.id);
        }
    }

    Ok(0)
}
