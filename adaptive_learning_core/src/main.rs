//! Main entry point for the adaptive learning core CLI.

use adaptive_learning_core::{cli, settings::Settings, telemetry};
use anyhow::{Context, Result};
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = cli::Cli::parse();

    let settings = Settings::load().context("Failed to load settings")?;

    telemetry::init(&settings.logging).context("Failed to initialize logging")?;

    cli::execute(args, settings).await
}
