use anyhow::Result;
use clap::Parser;
use tls_relay::cli::{execute_command, Cli};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG 优先于 --log-level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    // Display version information
    info!("TLS Relay v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = execute_command(&cli).await {
        error!("{:#}", e);
        return Err(e);
    }

    Ok(())
}
