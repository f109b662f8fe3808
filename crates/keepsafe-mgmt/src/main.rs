use anyhow::Result;
use clap::Parser;
use keepsafe_mgmt::cli::Cli;
use keepsafe_mgmt::{KeepsafeConfig, LogFormat};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = KeepsafeConfig::load(&cli.config)?;

    // stdout is reserved for command output
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(fmt::layer().json().with_writer(std::io::stderr)).init(),
        LogFormat::Text => registry.with(fmt::layer().with_writer(std::io::stderr)).init(),
    }

    if !cli.config.exists() {
        tracing::debug!(path = %cli.config.display(), "config file not found, using defaults and environment");
    }

    cli.run(config).await
}
