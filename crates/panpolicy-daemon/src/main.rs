//! panpolicyd - path-selection policy daemon

use anyhow::Context;
use clap::Parser;
use tracing::info;

use panpolicy_daemon::{load_configuration, shutdown_signal, Cli, Daemon};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Initialize logging
    setup_logging(cli.verbose);

    // Load configuration
    let config = load_configuration(&cli).context("Failed to load configuration")?;

    // Build server-side policy
    let daemon = Daemon::new(&config)
        .await
        .context("Failed to build daemon policy")?;

    daemon
        .run(shutdown_signal())
        .await
        .context("Daemon failed")?;

    info!("panpolicyd exited successfully");
    Ok(())
}

/// Setup logging based on verbosity level
fn setup_logging(verbose: bool) {
    let log_level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
