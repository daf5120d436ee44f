use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use clist_storage::PgContestStore;
use clist_sync::{SyncConfig, SyncPipeline, UpdateParams};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "clist-cli")]
#[command(about = "Contest schedule updater")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every selected resource and reconcile its contests.
    Update(UpdateArgs),
    /// Apply database migrations.
    Migrate,
    /// Load resource definitions from a YAML file.
    ImportResources { path: PathBuf },
    /// Run updates on the configured cron until interrupted.
    Schedule,
}

#[derive(Debug, Default, Args)]
struct UpdateArgs {
    /// Include disabled resources.
    #[arg(long)]
    all: bool,
    /// Restrict the run to these resource ids.
    #[arg(long = "resource", value_name = "ID")]
    resources: Vec<i64>,
    /// Restrict the run to resources whose host matches this regex.
    #[arg(long = "host", value_name = "REGEX")]
    hosts: Vec<String>,
    /// Ask sources for their full archive instead of the recent window.
    #[arg(long)]
    full: bool,
    #[arg(long)]
    skip_check_time: bool,
    /// Only write contests whose title matches this regex.
    #[arg(long)]
    title: Option<String>,
    /// Report deletions without performing them.
    #[arg(long)]
    debug: bool,
}

impl From<UpdateArgs> for UpdateParams {
    fn from(args: UpdateArgs) -> Self {
        UpdateParams {
            enabled_only: !args.all,
            resource_ids: args.resources,
            host_patterns: args.hosts,
            parse_full_list: args.full,
            skip_check_time: args.skip_check_time,
            title: args.title,
            debug: args.debug,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("clist=info,warn")))
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Update(UpdateArgs::default())) {
        Commands::Update(args) => {
            let pipeline = SyncPipeline::from_config(config).await?;
            let report = pipeline.run_once(args.into()).await?;
            let written: usize = report.resources.iter().map(|s| s.written()).sum();
            println!(
                "update complete: run_id={} resources={} failed={} written={}",
                report.run_id,
                report.resources.len(),
                report.failed(),
                written
            );
        }
        Commands::Migrate => {
            let store = PgContestStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::ImportResources { path } => {
            let pipeline = SyncPipeline::from_config(config).await?;
            let count = pipeline.import_resources(&path).await?;
            println!("imported {count} resources from {}", path.display());
        }
        Commands::Schedule => {
            config.scheduler_enabled = true;
            let pipeline = SyncPipeline::from_config(config).await?;
            let Some(sched) = pipeline.maybe_build_scheduler().await? else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().update_cron, "scheduler running");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down scheduler");
        }
    }

    Ok(())
}
