use anyhow::Result;
use tracing::info;

use crate::config::RelayConfig;
use crate::server;

use super::cert;
use super::config::{check_config, expand_path, expand_tls_paths};
use super::template;

/// Execute CLI commands
pub async fn execute_command(cli: &super::Cli) -> Result<()> {
    use super::Commands;

    match &cli.command {
        Commands::Run { config, port } => {
            run_relay(config.as_deref(), *port).await?;
        }
        Commands::Check { config, format } => {
            let config_path = expand_path(config)?;
            check_config(&config_path, format)?;
        }
        Commands::Template { output } => {
            template::generate_config_template(output.as_deref())?;
        }
        Commands::Cert {
            cert_out,
            key_out,
            common_name,
            alt_names,
        } => {
            cert::generate_certificate(cert_out, key_out, common_name, alt_names)?;
        }
    }

    Ok(())
}

/// 加载配置并应用命令行覆盖项
pub fn load_relay_config(config: Option<&str>, port: Option<u16>) -> Result<RelayConfig> {
    let mut relay_config = match config {
        Some(path) => {
            let config_path = expand_path(path)?;
            info!("Loading relay configuration from: {}", config_path);
            RelayConfig::load(&config_path)?
        }
        None => {
            info!("No configuration file given, using defaults");
            RelayConfig::default()
        }
    };

    if let Some(port) = port {
        relay_config.listen.port = port;
    }
    expand_tls_paths(&mut relay_config);
    relay_config.validate()?;

    Ok(relay_config)
}

/// Run TLS relay
async fn run_relay(config: Option<&str>, port: Option<u16>) -> Result<()> {
    let relay_config = load_relay_config(config, port)?;
    server::run_server(relay_config).await
}
