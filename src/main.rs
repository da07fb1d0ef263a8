//! quotagate command-line entry point.

mod cli;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use quotagate::config::{LogFormat, LoggingConfig};

fn init_tracing(logging: &LoggingConfig) {
    // RUST_LOG wins over the configured filter.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is normal.
    let _ = dotenvy::dotenv();

    let args = cli::Cli::parse();
    let config =
        cli::with_startup_logging(std::io::stderr, || cli::load_config(args.config.as_deref()))?;
    init_tracing(&config.logging);

    cli::run(args.command, config).await
}
