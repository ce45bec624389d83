//! Service Bus Key Rotator CLI
//!
//! This is the main entry point for the CLI application.

use anyhow::Result;
use clap::Parser;
use servicebus_key_rotator::cli;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first so --log-json can shape the subscriber
    let cli = cli::Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    // Execute the command
    cli::execute(cli).await
}
