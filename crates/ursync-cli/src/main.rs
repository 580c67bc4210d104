use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use ursync_storage::PgStore;
use ursync_sync::SyncConfig;

#[derive(Debug, Parser)]
#[command(name = "ursync-cli")]
#[command(about = "User registry reconciliation service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply migrations, start the scheduler and serve the webhook endpoints.
    Serve,
    /// Run one pull-and-reconcile cycle against the upstream registry.
    Sync,
    /// Apply database migrations and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,ursync=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => ursync_web::serve_from_env().await?,
        Commands::Sync => {
            let summary = ursync_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} fetched={} inserted={} skipped={} failed={}",
                summary.run_id,
                summary.fetched,
                summary.report.inserted,
                summary.report.skipped_duplicate,
                summary.report.failed
            );
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = PgStore::connect(&config.database_url, config.pool_config()).await?;
            store.migrate().await?;
            info!("migrations applied");
        }
    }

    Ok(())
}
