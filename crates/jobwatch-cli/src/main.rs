use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use jobwatch_core::time_of_day;
use jobwatch_sync::{load_cache, resolve_config_path, scheduler_from_config, WatchConfig};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "jobwatch")]
#[command(about = "Watches job boards for new postings during operating hours")]
struct Cli {
    /// Config file; falls back to $JOBWATCH_CONFIG, then ./jobwatch.yaml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll until Ctrl-C or run_until.
    Run,
    /// Run a single search cycle now, ignoring the operating window.
    Once,
    /// Validate the config and print the resolved schedule.
    CheckConfig,
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Debug, Subcommand)]
enum CacheCommands {
    Stats,
    Clear,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,jobwatch=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

/// Token that fires on the first Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("received shutdown signal");
        trigger.cancel();
    });
    token
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let path = resolve_config_path(cli.config);
    let config = WatchConfig::load(&path).with_context(|| format!("loading {}", path.display()))?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let mut scheduler = scheduler_from_config(&config).await?;
            let state = scheduler.run(shutdown_token()).await;
            info!(?state, "watcher exited");
        }
        Commands::Once => {
            let mut scheduler = scheduler_from_config(&config).await?;
            let summary = scheduler.run_cycle(&shutdown_token()).await;
            let mut cache = scheduler.into_cache();
            cache.flush().await;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::CheckConfig => {
            let schedule = config.schedule_state()?;
            println!("config: {}", path.display());
            println!("job titles: {}", config.job_titles.join(", "));
            println!(
                "window: {} - {} ({}){}",
                time_of_day::format(&schedule.window.start),
                time_of_day::format(&schedule.window.end),
                schedule.time_zone,
                if schedule.window.crosses_midnight() { ", crosses midnight" } else { "" }
            );
            println!("interval: {}s", schedule.run_interval.as_secs());
            if let Some(until) = config.run_until_utc()? {
                println!("run until: {until}");
            }
            for query in config.query_plan().queries(schedule.look_back(Utc::now())) {
                println!("query: {}", query.text());
            }
            println!("cache: {} (max {})", config.cache_path.display(), config.cache_max_size);
        }
        Commands::Cache { command } => {
            let mut cache = load_cache(&config).await;
            match command {
                CacheCommands::Stats => {
                    println!(
                        "cache: {} entries={} max={} policy={:?}",
                        cache.path().display(),
                        cache.len(),
                        cache.max_size(),
                        cache.policy()
                    );
                }
                CacheCommands::Clear => {
                    let removed = cache.len();
                    cache
                        .clear()
                        .await
                        .with_context(|| format!("clearing {}", cache.path().display()))?;
                    println!("cleared {removed} fingerprints from {}", cache.path().display());
                }
            }
        }
    }

    Ok(())
}
