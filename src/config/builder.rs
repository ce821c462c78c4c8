use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;

use super::{validator::ConfigValidator, RateLimitConfig, RelayConfig};

/// RelayConfig Builder
#[derive(Debug, Default)]
pub struct RelayConfigBuilder {
    config: RelayConfig,
}

impl RelayConfigBuilder {
    /// 创建新的 Builder（所有字段使用默认值）
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置监听地址
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen.addr = addr.into();
        self
    }

    /// 设置监听端口（0 表示由系统分配）
    pub fn listen_port(mut self, port: u16) -> Self {
        self.config.listen.port = port;
        self
    }

    /// 设置后端地址和端口
    pub fn backend(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.backend.host = host.into();
        self.config.backend.port = port;
        self
    }

    /// 设置后端证书验证名称
    pub fn backend_server_name(mut self, name: impl Into<String>) -> Self {
        self.config.backend.server_name = Some(name.into());
        self
    }

    /// 设置后端连接超时
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.backend.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// 设置证书路径
    pub fn cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.tls.cert_path = path.into();
        self
    }

    /// 设置私钥路径
    pub fn key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.tls.key_path = path.into();
        self
    }

    /// 设置 CA 证书路径
    pub fn ca_cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.tls.ca_cert_path = Some(path.into());
        self
    }

    /// 设置是否跳过证书验证
    pub fn skip_verify(mut self, skip: bool) -> Self {
        self.config.tls.skip_verify = skip;
        self
    }

    /// 设置握手超时
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.tls.handshake_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// 设置中继缓冲区大小
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.relay.buffer_size = size;
        self
    }

    /// 设置写入重试上限
    pub fn write_retry_limit(mut self, limit: u32) -> Self {
        self.config.relay.write_retry_limit = limit;
        self
    }

    /// 设置等待可写的超时
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.relay.write_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// 设置空闲超时
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.relay.idle_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// 设置是否记录客户端首行
    pub fn peek_first_line(mut self, enabled: bool) -> Self {
        self.config.relay.peek_first_line = enabled;
        self
    }

    /// 设置速率限制
    pub fn rate_limit(mut self, requests_per_second: u32, burst_size: u32) -> Self {
        self.config.rate_limit = Some(RateLimitConfig {
            requests_per_second,
            burst_size,
        });
        self
    }

    /// 构建 RelayConfig 并验证
    pub fn build(self) -> Result<RelayConfig> {
        ConfigValidator::validate_relay_config(&self.config)?;
        Ok(self.config)
    }
}
