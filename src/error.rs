/// 自定义错误类型
///
/// 连接级别的错误使用 thiserror 精确建模，由生命周期控制器返回给服务器循环；
/// 进程级别的错误（配置、证书、监听）在 main 中使用 anyhow 处理
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// 超时发生的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// 与客户端的 TLS 握手
    InboundHandshake,
    /// 连接后端 TCP
    BackendConnect,
    /// 与后端的 TLS 握手
    OutboundHandshake,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::InboundHandshake => write!(f, "inbound handshake"),
            Stage::BackendConnect => write!(f, "backend connect"),
            Stage::OutboundHandshake => write!(f, "outbound handshake"),
        }
    }
}

/// TLS Relay 的连接级错误类型
#[derive(Error, Debug)]
pub enum RelayError {
    /// 客户端握手失败
    #[error("Inbound TLS handshake with {peer} failed: {source}")]
    InboundHandshake {
        peer: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// 后端连接失败
    #[error("Failed to connect to backend {addr}: {source}")]
    BackendConnect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 后端握手失败（包括证书验证失败）
    #[error("Outbound TLS handshake with {addr} failed: {source}")]
    OutboundHandshake {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// 超时错误
    #[error("{stage} timed out after {duration:?}")]
    Timeout { stage: Stage, duration: Duration },

    /// 配置错误
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// TLS 协议错误
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// I/O 错误
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// 其他错误（保留与 anyhow 的兼容性）
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    /// 创建客户端握手失败错误
    pub fn inbound_handshake(peer: SocketAddr, source: io::Error) -> Self {
        Self::InboundHandshake { peer, source }
    }

    /// 创建后端连接失败错误
    pub fn backend_connect(addr: impl Into<String>, source: io::Error) -> Self {
        Self::BackendConnect {
            addr: addr.into(),
            source,
        }
    }

    /// 创建后端握手失败错误
    pub fn outbound_handshake(addr: impl Into<String>, source: io::Error) -> Self {
        Self::OutboundHandshake {
            addr: addr.into(),
            source,
        }
    }

    /// 创建超时错误
    pub fn timeout(stage: Stage, duration: Duration) -> Self {
        Self::Timeout { stage, duration }
    }

    /// 创建配置错误
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// 检查是否为超时错误
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// 检查是否为握手失败（任一方向，含握手超时）
    pub fn is_handshake_failure(&self) -> bool {
        matches!(
            self,
            Self::InboundHandshake { .. }
                | Self::OutboundHandshake { .. }
                | Self::Timeout {
                    stage: Stage::InboundHandshake | Stage::OutboundHandshake,
                    ..
                }
        )
    }

    /// 检查是否为后端连接失败（含连接超时）
    pub fn is_backend_unreachable(&self) -> bool {
        matches!(
            self,
            Self::BackendConnect { .. }
                | Self::Timeout {
                    stage: Stage::BackendConnect,
                    ..
                }
        )
    }
}
