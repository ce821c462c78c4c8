/// 监听 socket 与连接参数
use anyhow::{Context, Result};
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::warn;

use crate::config::ListenConfig;

/// TCP keepalive 空闲时间
pub const KEEPALIVE_TIME: Duration = Duration::from_secs(30);

/// TCP keepalive 探测间隔
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// 文件描述符耗尽时的退避时间
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[cfg(unix)]
const ENFILE: i32 = 23;
#[cfg(unix)]
const EMFILE: i32 = 24;
#[cfg(windows)]
const WSAEMFILE: i32 = 10024;

/// 解析监听地址
pub fn resolve_listen_addr(config: &ListenConfig) -> Result<SocketAddr> {
    (config.addr.as_str(), config.port)
        .to_socket_addrs()
        .with_context(|| format!("Failed to resolve listen address {}", config.socket_addr()))?
        .next()
        .with_context(|| format!("No address found for {}", config.socket_addr()))
}

/// 创建监听 socket（SO_REUSEADDR + 指定 backlog）
pub fn bind_listener(config: &ListenConfig) -> Result<TcpListener> {
    let addr = resolve_listen_addr(config)?;
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .context("Failed to create listening socket")?;
    socket
        .set_reuse_address(true)
        .context("Failed to set SO_REUSEADDR")?;
    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("Failed to bind {}", addr))?;
    socket
        .listen(config.backlog.min(i32::MAX as u32) as i32)
        .with_context(|| format!("Failed to listen on {}", addr))?;

    let listener = TcpListener::from_std(std::net::TcpListener::from(socket))
        .context("Failed to register listener with the runtime")?;
    Ok(listener)
}

/// 设置 TCP_NODELAY 和 keepalive；失败只记录警告
pub fn tune_stream(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }

    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_TIME)
        .with_interval(KEEPALIVE_INTERVAL);

    let sock_ref = SockRef::from(stream);
    if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
        warn!(
            "Failed to set TCP keepalive on {}: {}",
            stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unknown".into()),
            e
        );
    }
}

/// accept 错误的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptErrorKind {
    /// 立即重试
    Retry,
    /// 文件描述符耗尽，退避后继续
    Backoff,
    /// 对端在 accept 完成前放弃，忽略
    Skip,
    /// 监听 socket 不可用
    Fatal,
}

/// 对 accept 返回的错误分类
pub fn classify_accept_error(err: &io::Error) -> AcceptErrorKind {
    if is_descriptor_exhaustion(err) {
        return AcceptErrorKind::Backoff;
    }

    match err.kind() {
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => AcceptErrorKind::Retry,
        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset => {
            AcceptErrorKind::Skip
        }
        _ => AcceptErrorKind::Fatal,
    }
}

fn is_descriptor_exhaustion(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        matches!(err.raw_os_error(), Some(EMFILE) | Some(ENFILE))
    }
    #[cfg(windows)]
    {
        err.raw_os_error() == Some(WSAEMFILE)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = err;
        false
    }
}
