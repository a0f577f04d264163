//! PhenoDCC crawler - main entry point

use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use phenodcc_crawler::config::build_tokenizer;
use phenodcc_crawler::source::StandardDriverFactory;
use phenodcc_crawler::{Cli, InstanceLock, SessionOrchestrator, Settings};
use phenodcc_tracker::{AffinityRater, Tracker};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run(cli).await {
        error!(error = %e, "Crawler failed");
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> phenodcc_crawler::Result<()> {
    // The lock gates everything: a second instance must exit without
    // touching the tracker, and a corrupt lock path needs an operator.
    let lock = InstanceLock::acquire()?;
    let result = run_locked(&cli).await;
    lock.release();
    result
}

async fn run_locked(cli: &Cli) -> phenodcc_crawler::Result<()> {
    let settings = Arc::new(Settings::from_cli(cli)?);
    settings.create_required_directories()?;

    let tracker = Tracker::connect(&settings.tracker_url).await?;
    let centres = tracker.centre_map().await?;
    let tokenizer = Arc::new(build_tokenizer(&settings, centres)?);

    let orchestrator = SessionOrchestrator::new(
        tracker,
        tokenizer,
        Arc::new(StandardDriverFactory::default()),
        Arc::new(AffinityRater),
        settings,
    );
    orchestrator.run().await
}
