use anyhow::Result;
use clap::{Parser, Subcommand};
use llcwatch_ingest::IngestConfig;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "llcwatch")]
#[command(about = "Watch a state registry for newly filed LLCs")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion pass against the registry.
    Scrape {
        /// Recency window in days (defaults to LLCWATCH_SCRAPE_DAYS).
        #[arg(long)]
        days: Option<u32>,
    },
    /// Serve the read API and the manual scrape trigger.
    Serve,
    /// Run ingestion on a cron schedule until interrupted.
    Watch,
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("llcwatch=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Scrape { days } => {
            let config = IngestConfig::from_env();
            let days = days.unwrap_or(config.scrape_days);
            let summary = llcwatch_ingest::run_ingestion(&config, days).await?;
            println!(
                "scrape complete: run_id={} scraped={} inserted={}",
                summary.run_id, summary.scraped, summary.inserted
            );
        }
        Commands::Serve => llcwatch_web::serve_from_env().await?,
        Commands::Watch => llcwatch_ingest::watch_from_env().await?,
    }

    Ok(())
}
