use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use mcf_storage::SqliteStore;
use mcf_sync::{run_sync_once, RunOptions, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(name = "mcf-cli")]
#[command(about = "Muskoka Cottage Finder command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Visit every active source once.
    Sync(SyncArgs),
    /// Create the database and its tables.
    Migrate,
    /// Run syncs on the configured cron schedule until interrupted.
    Schedule,
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    /// Visit at most this many sources.
    #[arg(long)]
    max_urls: Option<usize>,
    /// Skip blog post extraction.
    #[arg(long)]
    no_posts: bool,
    /// Visit only the first three sources.
    #[arg(long)]
    test: bool,
}

impl SyncArgs {
    fn run_options(&self, config: &SyncConfig) -> RunOptions {
        RunOptions {
            max_urls: self.max_urls,
            extract_posts: config.extract_posts && !self.no_posts,
            test_mode: self.test,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            let options = args.run_options(&config);
            let summary = run_sync_once(config, &options).await?;
            println!(
                "sync complete: run_id={} urls={} listings={} new={} price_changes={} \
                 new_posts={} errors={}",
                summary.run_id,
                summary.counts.urls_processed,
                summary.counts.listings_found,
                summary.counts.new_listings,
                summary.price_changes,
                summary.counts.new_posts,
                summary.counts.errors
            );
        }
        Commands::Migrate => {
            SqliteStore::connect(&config.database_url)
                .await
                .with_context(|| format!("migrating {}", config.database_url))?;
            println!("database ready: {}", config.database_url);
        }
        Commands::Schedule => {
            let cron = config.sync_cron.clone();
            let pipeline = Arc::new(SyncPipeline::connect(config).await?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                bail!(
                    "scheduler disabled; set MCF_SCHEDULER_ENABLED=true \
                     or scheduler_enabled in mcf.yaml"
                );
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %cron, "scheduler running, press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_flags_map_to_run_options() {
        let cli =
            Cli::try_parse_from(["mcf-cli", "sync", "--max-urls", "7", "--no-posts"]).unwrap();
        let Some(Commands::Sync(args)) = cli.command else {
            panic!("expected sync command");
        };
        let options = args.run_options(&SyncConfig::default());
        assert_eq!(options.max_urls, Some(7));
        assert!(!options.extract_posts);
        assert!(!options.test_mode);
    }

    #[test]
    fn bare_invocation_has_no_subcommand() {
        let cli = Cli::try_parse_from(["mcf-cli"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn config_can_disable_posts_even_without_flag() {
        let config = SyncConfig {
            extract_posts: false,
            ..Default::default()
        };
        let options = SyncArgs {
            test: true,
            ..Default::default()
        }
        .run_options(&config);
        assert!(!options.extract_posts);
        assert!(options.test_mode);
    }
}
