use anyhow::{bail, Result};
use tracing::warn;

use super::{
    BackendConfig, ListenConfig, RateLimitConfig, RelayConfig, RelayOptions, TlsSettings,
    MAX_BUFFER_SIZE, MIN_BUFFER_SIZE,
};

/// 配置验证器 - 负责所有配置验证逻辑
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证端口号
    pub fn validate_port(port: u16, context: &str) -> Result<()> {
        if port == 0 {
            bail!("{}: port cannot be 0", context);
        }
        Ok(())
    }

    /// 验证地址不为空
    pub fn validate_address(addr: &str, context: &str) -> Result<()> {
        if addr.trim().is_empty() {
            bail!("{}: address cannot be empty", context);
        }
        Ok(())
    }

    /// 验证超时不为 0
    pub fn validate_timeout(ms: u64, context: &str) -> Result<()> {
        if ms == 0 {
            bail!("{}: timeout must be greater than 0", context);
        }
        Ok(())
    }

    /// 验证完整配置
    pub fn validate_relay_config(config: &RelayConfig) -> Result<()> {
        Self::validate_listen_config(&config.listen)?;
        Self::validate_backend_config(&config.backend)?;
        Self::validate_tls_settings(&config.tls)?;
        Self::validate_relay_options(&config.relay)?;

        if let Some(ref rate_limit) = config.rate_limit {
            Self::validate_rate_limit_config(rate_limit)?;
        }

        Ok(())
    }

    /// 验证监听配置
    pub fn validate_listen_config(config: &ListenConfig) -> Result<()> {
        Self::validate_address(&config.addr, "listen.addr")?;
        if config.backlog == 0 {
            bail!("listen.backlog must be greater than 0");
        }
        Ok(())
    }

    /// 验证后端配置
    pub fn validate_backend_config(config: &BackendConfig) -> Result<()> {
        Self::validate_address(&config.host, "backend.host")?;
        Self::validate_port(config.port, "backend.port")?;
        Self::validate_timeout(config.connect_timeout_ms, "backend.connect_timeout_ms")?;
        Ok(())
    }

    /// 验证 TLS 配置
    pub fn validate_tls_settings(config: &TlsSettings) -> Result<()> {
        if config.cert_path.as_os_str().is_empty() {
            bail!("tls.cert_path cannot be empty");
        }
        if config.key_path.as_os_str().is_empty() {
            bail!("tls.key_path cannot be empty");
        }
        if config.skip_verify && config.ca_cert_path.is_some() {
            bail!("tls.ca_cert_path has no effect when tls.skip_verify is enabled");
        }
        if config.skip_verify {
            warn!("tls.skip_verify is enabled, backend certificates will NOT be verified");
        }
        Self::validate_timeout(config.handshake_timeout_ms, "tls.handshake_timeout_ms")?;
        Ok(())
    }

    /// 验证中继循环配置
    pub fn validate_relay_options(config: &RelayOptions) -> Result<()> {
        if config.buffer_size < MIN_BUFFER_SIZE {
            bail!(
                "relay.buffer_size must be at least {} bytes (current: {})",
                MIN_BUFFER_SIZE,
                config.buffer_size
            );
        }
        if config.buffer_size > MAX_BUFFER_SIZE {
            bail!(
                "relay.buffer_size cannot exceed {} bytes (current: {})",
                MAX_BUFFER_SIZE,
                config.buffer_size
            );
        }
        if config.write_retry_limit == 0 {
            bail!("relay.write_retry_limit must be greater than 0");
        }
        Self::validate_timeout(config.write_timeout_ms, "relay.write_timeout_ms")?;
        if let Some(ms) = config.idle_timeout_ms {
            Self::validate_timeout(ms, "relay.idle_timeout_ms")?;
        }
        Self::validate_timeout(config.shutdown_timeout_ms, "relay.shutdown_timeout_ms")?;
        Ok(())
    }

    /// 验证速率限制配置
    pub fn validate_rate_limit_config(config: &RateLimitConfig) -> Result<()> {
        if config.requests_per_second == 0 {
            bail!("rate_limit.requests_per_second must be greater than 0");
        }
        if config.burst_size == 0 {
            bail!("rate_limit.burst_size must be greater than 0");
        }
        if config.burst_size < config.requests_per_second {
            warn!(
                "rate_limit.burst_size ({}) is less than requests_per_second ({}), \
                 this may cause frequent rate limiting",
                config.burst_size, config.requests_per_second
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_validate_port() {
        assert!(ConfigValidator::validate_port(8000, "test").is_ok());
        assert!(ConfigValidator::validate_port(0, "test").is_err());
    }

    #[test]
    fn test_validate_address() {
        assert!(ConfigValidator::validate_address("127.0.0.1", "test").is_ok());
        assert!(ConfigValidator::validate_address("", "test").is_err());
        assert!(ConfigValidator::validate_address("   ", "test").is_err());
    }

    #[test]
    fn test_listen_port_zero_is_allowed() {
        // 端口 0 表示由系统分配
        let config = ListenConfig {
            port: 0,
            ..Default::default()
        };
        assert!(ConfigValidator::validate_listen_config(&config).is_ok());
    }

    #[test]
    fn test_validate_backend_config() {
        let mut config = BackendConfig::default();
        assert!(ConfigValidator::validate_backend_config(&config).is_ok());

        config.port = 0;
        assert!(ConfigValidator::validate_backend_config(&config).is_err());

        config.port = 8001;
        config.connect_timeout_ms = 0;
        assert!(ConfigValidator::validate_backend_config(&config).is_err());
    }

    #[test]
    fn test_validate_tls_settings() {
        let mut config = TlsSettings::default();
        assert!(ConfigValidator::validate_tls_settings(&config).is_ok());

        config.skip_verify = true;
        config.ca_cert_path = Some(PathBuf::from("ca.pem"));
        assert!(ConfigValidator::validate_tls_settings(&config).is_err());

        config.ca_cert_path = None;
        assert!(ConfigValidator::validate_tls_settings(&config).is_ok());

        config.key_path = PathBuf::new();
        assert!(ConfigValidator::validate_tls_settings(&config).is_err());
    }

    #[test]
    fn test_validate_relay_options() {
        let mut config = RelayOptions::default();
        assert!(ConfigValidator::validate_relay_options(&config).is_ok());

        config.buffer_size = 4096;
        assert!(ConfigValidator::validate_relay_options(&config).is_err());

        config.buffer_size = MAX_BUFFER_SIZE + 1;
        assert!(ConfigValidator::validate_relay_options(&config).is_err());

        config.buffer_size = MIN_BUFFER_SIZE;
        config.write_retry_limit = 0;
        assert!(ConfigValidator::validate_relay_options(&config).is_err());

        config.write_retry_limit = 8;
        config.write_timeout_ms = 0;
        assert!(ConfigValidator::validate_relay_options(&config).is_err());

        config.write_timeout_ms = 1_000;
        config.idle_timeout_ms = Some(0);
        assert!(ConfigValidator::validate_relay_options(&config).is_err());
    }

    #[test]
    fn test_validate_rate_limit_config() {
        let valid = RateLimitConfig {
            requests_per_second: 10,
            burst_size: 20,
        };
        assert!(ConfigValidator::validate_rate_limit_config(&valid).is_ok());

        let zero_rate = RateLimitConfig {
            requests_per_second: 0,
            burst_size: 20,
        };
        assert!(ConfigValidator::validate_rate_limit_config(&zero_rate).is_err());

        let zero_burst = RateLimitConfig {
            requests_per_second: 10,
            burst_size: 0,
        };
        assert!(ConfigValidator::validate_rate_limit_config(&zero_burst).is_err());
    }
}
