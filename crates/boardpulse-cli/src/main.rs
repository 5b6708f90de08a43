use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use boardpulse_core::{BoardCategory, JobBoard};
use boardpulse_pipeline::{PipelineConfig, PipelineOrchestrator};
use boardpulse_scrapers::ScraperRegistry;
use boardpulse_store::{MemoryStore, PgStore, Store};

#[derive(Debug, Parser)]
#[command(name = "boardpulse")]
#[command(about = "Job-board hiring-efficiency pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one full pipeline pass.
    Run,
    /// Start the cron scheduler and run until interrupted.
    Schedule,
    /// Show recent pipeline runs.
    History {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Show seven-day pipeline aggregates.
    Stats,
    /// Apply database migrations.
    Migrate,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn build_store(config: &PipelineConfig) -> Result<Arc<dyn Store>> {
    match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url)
                .await
                .context("connecting to database")?;
            Ok(Arc::new(store))
        }
        None => {
            info!("DATABASE_URL not set; using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Make sure every board the registry can scrape exists as a row. Boards
/// already in the store keep their id and category.
async fn ensure_boards(store: &dyn Store, registry: &ScraperRegistry) -> Result<()> {
    let known: Vec<String> = store
        .list_boards()
        .await?
        .into_iter()
        .map(|b| b.name)
        .collect();
    for name in registry.board_names() {
        if known.contains(&name) {
            continue;
        }
        let board = JobBoard {
            id: Uuid::new_v4(),
            name: name.clone(),
            url: format!("https://{}", name.to_lowercase()),
            category: BoardCategory::General,
        };
        store.upsert_board(&board).await?;
        info!(board = %name, "registered board from fixtures");
    }
    Ok(())
}

async fn build_orchestrator(config: PipelineConfig) -> Result<Arc<PipelineOrchestrator>> {
    let store = build_store(&config).await?;
    let registry = if config.fixtures_dir.is_dir() {
        ScraperRegistry::from_fixture_dir(&config.fixtures_dir)
            .context("loading scrape fixtures")?
    } else {
        ScraperRegistry::new()
    };
    ensure_boards(store.as_ref(), &registry).await?;
    let orchestrator = PipelineOrchestrator::new(store, registry, config)?;
    Ok(Arc::new(orchestrator))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let orchestrator = build_orchestrator(config).await?;
            let run = orchestrator.run_pipeline().await;
            println!(
                "run {} finished: status={:?} jobs={} completed={} failed={}",
                run.run_id, run.status, run.total_jobs, run.completed_jobs, run.failed_jobs
            );
            for error in &run.errors {
                println!("  error: {error}");
            }
        }
        Commands::Schedule => {
            let mut config = config;
            config.scheduler_enabled = true;
            let orchestrator = build_orchestrator(config).await?;
            let scheduler = orchestrator
                .maybe_build_scheduler()
                .await?
                .context("scheduler was not built")?;
            scheduler.start().await.context("starting scheduler")?;
            println!("scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        }
        Commands::History { limit } => {
            let orchestrator = build_orchestrator(config).await?;
            for run in orchestrator.get_run_history(limit).await? {
                println!(
                    "{}  {:?}  jobs={}/{} failed={}  started={}",
                    run.run_id,
                    run.status,
                    run.completed_jobs,
                    run.total_jobs,
                    run.failed_jobs,
                    run.started_at
                );
            }
        }
        Commands::Stats => {
            let orchestrator = build_orchestrator(config).await?;
            let stats = orchestrator.get_pipeline_stats().await?;
            println!(
                "last {}d: runs={} (ok={} partial={} failed={}) run_success={:.1}%",
                stats.period_days,
                stats.total_runs,
                stats.successful_runs,
                stats.partial_runs,
                stats.failed_runs,
                stats.run_success_rate
            );
            println!(
                "jobs={} completed={} failed={} job_success={:.1}% avg_duration={}s",
                stats.total_jobs,
                stats.completed_jobs,
                stats.failed_jobs,
                stats.job_success_rate,
                stats.avg_duration_secs
            );
        }
        Commands::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set for migrate")?;
            let store = PgStore::connect(url).await.context("connecting to database")?;
            store.run_migrations().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
