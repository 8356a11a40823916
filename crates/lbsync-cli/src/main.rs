use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use lbsync_build::{BuildConfig, BuildPipeline};
use lbsync_sync::{SyncConfig, UpdatePipeline};
use tracing::info;
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "lbsync")]
#[command(about = "Leaderboard snapshot sync and database build")]
struct Cli {
    /// Workspace config file; overrides LBSYNC_CONFIG.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Resync every game's runs snapshot and the verifier users file.
    Update,
    /// Refetch platforms, regions, levels and category variables.
    RefreshStatic,
    /// Load all snapshots into the SQLite database.
    Build,
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!("failed to initialize tracing: {e}"))
}

fn sync_config(path: Option<PathBuf>) -> SyncConfig {
    let mut config = SyncConfig::from_env();
    if let Some(path) = path {
        config.config_path = path;
    }
    config
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Update) {
        Commands::Update => {
            let pipeline = UpdatePipeline::from_sync_config(&sync_config(cli.config)).await?;
            let summary = pipeline.update_all_runs().await?;
            for game in &summary.games {
                info!(
                    game = %game.game_id,
                    resume_offset = game.resume_offset,
                    failed_probes = game.failed_probes,
                    fetched = game.fetched,
                    total = game.total,
                    unchanged = game.unchanged,
                    "game synced"
                );
            }
            println!(
                "update complete: run_id={} games={} verifiers_fetched={}/{}",
                summary.run_id,
                summary.games.len(),
                summary.verifiers_fetched,
                summary.verifiers_missing
            );
        }
        Commands::RefreshStatic => {
            let pipeline = UpdatePipeline::from_sync_config(&sync_config(cli.config)).await?;
            let summary = pipeline.refresh_static().await?;
            println!(
                "static refresh complete: written={} skipped={} categories={}",
                summary.files_written.len(),
                summary.files_skipped.len(),
                summary.categories
            );
        }
        Commands::Build => {
            let mut config = BuildConfig::from_env();
            if let Some(path) = cli.config {
                config.config_path = path;
            }
            let summary = BuildPipeline::open(&config).await?.run().await?;
            println!(
                "build complete: run_id={} players={} links={} mismatches={}",
                summary.run_id,
                summary.players,
                summary.player_links,
                summary.count_mismatches.len()
            );
        }
    }

    Ok(())
}
