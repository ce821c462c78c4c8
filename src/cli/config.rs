use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::config::RelayConfig;

#[derive(Serialize)]
struct CheckResult {
    valid: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    details: serde_json::Value,
}

/// Expand path with tilde (~) and make it absolute
pub fn expand_path(path: &str) -> Result<String> {
    let expanded = shellexpand::tilde(path);
    let path_buf = PathBuf::from(expanded.as_ref());

    if path_buf.is_absolute() {
        Ok(expanded.into_owned())
    } else {
        // Convert relative path to absolute
        std::env::current_dir()
            .context("Failed to get current directory")?
            .join(&path_buf)
            .to_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("Invalid path: {}", path))
    }
}

/// 展开 TLS 文件路径中的 ~
pub fn expand_tls_paths(config: &mut RelayConfig) {
    fn tilde(path: &Path) -> PathBuf {
        match path.to_str() {
            Some(s) => PathBuf::from(shellexpand::tilde(s).as_ref()),
            None => path.to_path_buf(),
        }
    }

    config.tls.cert_path = tilde(&config.tls.cert_path);
    config.tls.key_path = tilde(&config.tls.key_path);
    if let Some(ref ca) = config.tls.ca_cert_path {
        config.tls.ca_cert_path = Some(tilde(ca));
    }
}

/// 收集配置中需要提醒用户的问题
fn collect_warnings(config: &RelayConfig) -> Vec<String> {
    let mut warnings = Vec::new();

    if !config.tls.cert_path.exists() {
        warnings.push(format!(
            "Certificate file not found: {:?}",
            config.tls.cert_path
        ));
    }
    if !config.tls.key_path.exists() {
        warnings.push(format!("Key file not found: {:?}", config.tls.key_path));
    }
    if let Some(ref ca) = config.tls.ca_cert_path {
        if !ca.exists() {
            warnings.push(format!("CA certificate file not found: {:?}", ca));
        }
    }
    if config.tls.skip_verify {
        warnings.push("Backend certificate verification is disabled (skip_verify)".to_string());
    }

    warnings
}

fn verify_mode(config: &RelayConfig) -> String {
    if config.tls.skip_verify {
        "disabled".to_string()
    } else if let Some(anchor) = config.tls.trust_anchor() {
        format!("trust anchor {:?}", anchor)
    } else {
        "system roots".to_string()
    }
}

/// Check configuration file format
pub fn check_config(config_path: &str, format: &str) -> Result<()> {
    let path = Path::new(config_path);

    // Check if file exists
    if !path.exists() {
        if format == "json" {
            let result = CheckResult {
                valid: false,
                warnings: vec![],
                error: Some(format!("Configuration file not found: {}", config_path)),
                details: serde_json::json!({}),
            };
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else {
            println!("✗ Configuration file not found: {}", config_path);
        }
        anyhow::bail!("Configuration file not found: {}", config_path);
    }

    if format == "text" {
        println!("Checking configuration file: {}\n", config_path);
    }

    let mut config = match RelayConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            if format == "json" {
                let result = CheckResult {
                    valid: false,
                    warnings: vec![],
                    error: Some(format!("{:#}", e)),
                    details: serde_json::json!({}),
                };
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("✗ Configuration validation failed!");
                println!("\nError details:");
                println!("{:#}", e);

                println!("\nCommon issues:");
                println!("  1. Check TOML syntax (brackets, quotes, commas)");
                println!("  2. Verify section names: [listen] [backend] [tls] [relay] [rate_limit]");
                println!("  3. Ensure port numbers are valid (1-65535)");
                println!("  4. relay.buffer_size must be between 16 KiB and 16 MiB");
            }
            return Err(e);
        }
    };
    expand_tls_paths(&mut config);

    let warnings = collect_warnings(&config);

    if format == "json" {
        let result = CheckResult {
            valid: true,
            warnings,
            error: None,
            details: serde_json::json!({
                "listen": config.listen.socket_addr(),
                "backend": config.backend.socket_addr(),
                "server_name": config.backend.verify_name(),
                "cert_path": config.tls.cert_path,
                "key_path": config.tls.key_path,
                "verify": verify_mode(&config),
                "buffer_size": config.relay.buffer_size,
                "write_retry_limit": config.relay.write_retry_limit,
                "write_timeout_ms": config.relay.write_timeout_ms,
                "idle_timeout_ms": config.relay.idle_timeout_ms,
                "rate_limit": config.rate_limit,
            }),
        };
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("✓ Listen address: {}", config.listen.socket_addr());
        println!("✓ Backend: {}", config.backend.socket_addr());
        println!("✓ Backend server name: {}", config.backend.verify_name());
        println!("✓ Certificate path: {:?}", config.tls.cert_path);
        println!("✓ Key path: {:?}", config.tls.key_path);
        println!("✓ Backend verification: {}", verify_mode(&config));
        println!("✓ Buffer size: {} bytes", config.relay.buffer_size);
        println!("✓ Write timeout: {} ms", config.relay.write_timeout_ms);
        match config.relay.idle_timeout_ms {
            Some(ms) => println!("✓ Idle timeout: {} ms", ms),
            None => println!("✓ Idle timeout: none"),
        }
        if let Some(ref rate_limit) = config.rate_limit {
            println!(
                "✓ Rate limit: {} per second, burst {}",
                rate_limit.requests_per_second, rate_limit.burst_size
            );
        }
        for warning in &warnings {
            println!("⚠ Warning: {}", warning);
        }
        println!("\n✓ Relay configuration is valid!");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_path_makes_absolute() {
        let expanded = expand_path("relay.toml").unwrap();
        assert!(Path::new(&expanded).is_absolute());
        assert!(expanded.ends_with("relay.toml"));
    }

    #[test]
    fn test_check_missing_file() {
        assert!(check_config("/nonexistent/relay.toml", "text").is_err());
        assert!(check_config("/nonexistent/relay.toml", "json").is_err());
    }

    #[test]
    fn test_check_valid_and_invalid_files() {
        let dir = std::env::temp_dir();
        let valid = dir.join(format!("relay-check-valid-{}.toml", std::process::id()));
        let invalid = dir.join(format!("relay-check-invalid-{}.toml", std::process::id()));
        std::fs::write(&valid, "[backend]\nport = 9443\n").unwrap();
        std::fs::write(&invalid, "[relay]\nbuffer_size = 10\n").unwrap();

        assert!(check_config(valid.to_str().unwrap(), "json").is_ok());
        assert!(check_config(invalid.to_str().unwrap(), "text").is_err());

        let _ = std::fs::remove_file(valid);
        let _ = std::fs::remove_file(invalid);
    }

    #[test]
    fn test_collect_warnings() {
        let mut config = RelayConfig::default();
        config.tls.cert_path = PathBuf::from("/nonexistent/cert.pem");
        config.tls.key_path = PathBuf::from("/nonexistent/key.pem");
        config.tls.skip_verify = true;

        let warnings = collect_warnings(&config);
        assert_eq!(warnings.len(), 3);
        assert_eq!(verify_mode(&config), "disabled");
    }
}
