// 配置管理模块 - 使用模块化设计

mod builder;
mod validator;

// 重新导出 builder 和 validator
pub use builder::RelayConfigBuilder;
pub use validator::ConfigValidator;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 中继缓冲区的最小容量（一个完整 TLS 记录的明文上限）
pub const MIN_BUFFER_SIZE: usize = 16 * 1024;

/// 中继缓冲区的最大容量
pub const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// 监听配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// 监听地址
    pub addr: String,
    /// 监听端口
    pub port: u16,
    /// listen() 的 backlog 长度
    pub backlog: u32,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0".to_string(),
            port: 8000,
            backlog: 128,
        }
    }
}

impl ListenConfig {
    /// 监听地址字符串（host:port）
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }
}

/// 后端配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// 后端主机
    pub host: String,
    /// 后端端口
    pub port: u16,
    /// 用于证书验证的服务器名称（默认使用 host）
    pub server_name: Option<String>,
    /// TCP 连接超时（毫秒）
    pub connect_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8001,
            server_name: None,
            connect_timeout_ms: 5_000,
        }
    }
}

impl BackendConfig {
    /// 后端地址字符串（host:port）
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// 验证证书时使用的名称
    pub fn verify_name(&self) -> &str {
        self.server_name
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(&self.host)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// TLS 配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// 服务器证书路径（PEM）
    pub cert_path: PathBuf,
    /// 服务器私钥路径（PEM）
    pub key_path: PathBuf,
    /// 验证后端使用的 CA 证书（默认与 cert_path 相同）
    pub ca_cert_path: Option<PathBuf>,
    /// 使用系统根证书验证后端
    pub use_native_roots: bool,
    /// 是否跳过后端证书验证（仅用于测试）
    pub skip_verify: bool,
    /// 单次握手超时（毫秒）
    pub handshake_timeout_ms: u64,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            cert_path: PathBuf::from("cert/cert.pem"),
            key_path: PathBuf::from("cert/key.pem"),
            ca_cert_path: None,
            use_native_roots: false,
            skip_verify: false,
            handshake_timeout_ms: 10_000,
        }
    }
}

impl TlsSettings {
    /// 后端信任锚路径，未配置时使用服务器证书本身
    pub fn trust_anchor(&self) -> Option<&Path> {
        if self.use_native_roots || self.skip_verify {
            return self.ca_cert_path.as_deref();
        }
        Some(self.ca_cert_path.as_deref().unwrap_or(&self.cert_path))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// 中继循环配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayOptions {
    /// 中继缓冲区大小（字节）
    pub buffer_size: usize,
    /// 写入阻塞时的最大重试次数
    pub write_retry_limit: u32,
    /// 单次等待可写的超时（毫秒）
    pub write_timeout_ms: u64,
    /// 空闲超时（毫秒），不设置则无限等待
    pub idle_timeout_ms: Option<u64>,
    /// 是否记录客户端首行
    pub peek_first_line: bool,
    /// 关闭时发送 close_notify 的超时（毫秒）
    pub shutdown_timeout_ms: u64,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            buffer_size: MIN_BUFFER_SIZE,
            write_retry_limit: 64,
            write_timeout_ms: 5_000,
            idle_timeout_ms: None,
            peek_first_line: true,
            shutdown_timeout_ms: 1_000,
        }
    }
}

impl RelayOptions {
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// 速率限制配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// 每秒允许的新连接数
    pub requests_per_second: u32,
    /// 突发容量（允许短时间内的峰值连接数）
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 100,
            burst_size: 200,
        }
    }
}

/// 中继服务完整配置
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub listen: ListenConfig,
    pub backend: BackendConfig,
    pub tls: TlsSettings,
    pub relay: RelayOptions,
    /// 速率限制配置（可选）
    pub rate_limit: Option<RateLimitConfig>,
}

impl RelayConfig {
    /// 创建 Builder
    pub fn builder() -> RelayConfigBuilder {
        RelayConfigBuilder::new()
    }

    /// 验证配置
    pub fn validate(&self) -> anyhow::Result<()> {
        ConfigValidator::validate_relay_config(self)
    }

    /// 从 TOML 字符串解析并验证
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: RelayConfig =
            toml::from_str(content).context("Failed to parse relay configuration")?;
        config
            .validate()
            .context("Relay configuration validation failed")?;
        Ok(config)
    }

    /// 从文件加载配置
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file: {}", path))?;
        Self::from_toml(&content)
    }
}
