/// TLS 会话封装
///
/// 握手由 tokio-rustls 完成，完成后拆出底层 `TcpStream` 和 `rustls::Connection`，
/// 由本模块按就绪事件驱动非阻塞读写。每次读写都返回明确的 [`Outcome`]，
/// 阻塞、对端关闭和致命错误由 rustls / socket 的错误类型区分，而不是按返回值的正负推断
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::{rustls, TlsAcceptor, TlsConnector};
use tracing::debug;

/// 默认的 close_notify 发送超时
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// 单次读写的结果
#[derive(Debug)]
pub enum Outcome {
    /// 传输了 n (> 0) 字节
    Data(usize),
    /// 无法在不阻塞的情况下完成，稍后重试
    WouldBlock,
    /// 对端通过 close_notify 有序关闭
    Closed,
    /// 协议错误、I/O 错误或异常断开
    Fatal(io::Error),
}

impl Outcome {
    pub fn is_would_block(&self) -> bool {
        matches!(self, Outcome::WouldBlock)
    }

    /// 是否为终止性结果（Closed 或 Fatal）
    pub fn is_terminal(&self) -> bool {
        matches!(self, Outcome::Closed | Outcome::Fatal(_))
    }
}

/// 会话在中继中的角色
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// 服务端角色，面向客户端
    Inbound,
    /// 客户端角色，面向后端
    Outbound,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Inbound => write!(f, "inbound"),
            Role::Outbound => write!(f, "outbound"),
        }
    }
}

/// 已完成握手的加密会话
///
/// `write` 返回 `WouldBlock` 时，调用者必须用相同的数据重试；
/// 会话保证同一段明文不会被接收两次
#[async_trait]
pub trait Session: Send + Sync {
    /// 会话角色
    fn role(&self) -> Role;

    /// 读取已解密的数据
    fn read(&mut self, buf: &mut [u8]) -> Outcome;

    /// 写入明文，并将密文交给底层连接
    fn write(&mut self, data: &[u8]) -> Outcome;

    /// 会话内部是否已有无需等待传输层即可读取的内容
    fn has_buffered_data(&self) -> bool;

    /// 等待底层连接可读
    async fn readable(&self) -> io::Result<()>;

    /// 等待底层连接可写
    async fn writable(&self) -> io::Result<()>;

    /// 发送 close_notify（尽力而为，失败只记录日志）
    async fn shutdown(&mut self);

    /// 关闭会话并释放底层连接
    fn close(self)
    where
        Self: Sized,
    {
        drop(self);
    }
}

/// 以 try_read / try_write 适配 rustls 的同步 I/O 接口
struct SyncIo<'a>(&'a TcpStream);

impl Read for SyncIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.try_read(buf)
    }
}

impl Write for SyncIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// 基于 rustls 的 TLS 会话，独占一个 TCP 连接
pub struct TlsSession {
    stream: TcpStream,
    conn: rustls::Connection,
    role: Role,
    peer: SocketAddr,
    /// 上次 write 已接收但密文尚未全部发出的明文字节数
    accepted: usize,
    /// rustls 中尚未读取的明文字节数
    buffered_plaintext: usize,
    /// 已收到 close_notify
    peer_closed: bool,
    /// 传输层已到达 EOF
    eof: bool,
    shutdown_timeout: Duration,
}

impl TlsSession {
    fn new(stream: TcpStream, conn: rustls::Connection, role: Role, peer: SocketAddr) -> Self {
        let mut session = Self {
            stream,
            conn,
            role,
            peer,
            accepted: 0,
            buffered_plaintext: 0,
            peer_closed: false,
            eof: false,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        };
        // 握手期间可能已随 Finished 一起收到应用数据
        match session.conn.process_new_packets() {
            Ok(state) => {
                session.buffered_plaintext = state.plaintext_bytes_to_read();
                session.peer_closed = state.peer_has_closed();
            }
            Err(err) => {
                debug!(role = %role, "Invalid records after handshake: {}", err);
                session.eof = true;
            }
        }
        // 握手结束时可能还有未发出的记录（如 TLS 1.3 会话票据）
        if let Err(e) = session.flush_tls() {
            if e.kind() != io::ErrorKind::WouldBlock {
                debug!(role = %role, "Failed to flush post-handshake records: {}", e);
            }
        }
        session
    }

    /// 设置 close_notify 发送超时
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// 对端地址
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// 协商得到的协议版本
    pub fn protocol_version(&self) -> Option<rustls::ProtocolVersion> {
        self.conn.protocol_version()
    }

    /// 将 rustls 中待发送的密文写入 socket
    fn flush_tls(&mut self) -> io::Result<()> {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut SyncIo(&self.stream)) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "connection refused further TLS records",
                    ))
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// 从 socket 读取密文并解密；返回 Ok(false) 表示 socket 暂无数据
    fn fill_from_socket(&mut self) -> io::Result<bool> {
        loop {
            match self.conn.read_tls(&mut SyncIo(&self.stream)) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }

        match self.conn.process_new_packets() {
            Ok(state) => {
                self.buffered_plaintext = state.plaintext_bytes_to_read();
                self.peer_closed = state.peer_has_closed();
            }
            Err(err) => {
                // 尽量把 alert 发给对端
                let _ = self.flush_tls();
                return Err(io::Error::new(io::ErrorKind::InvalidData, err));
            }
        }

        // 处理记录时可能产生需要回应的消息（如 KeyUpdate）
        match self.flush_tls() {
            Err(e) if e.kind() != io::ErrorKind::WouldBlock => Err(e),
            _ => Ok(true),
        }
    }

    /// 对入站连接执行服务端握手
    pub async fn accept(
        acceptor: &TlsAcceptor,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> io::Result<Self> {
        let tls_stream = acceptor.accept(stream).await?;
        let (stream, conn) = tls_stream.into_inner();
        Ok(Self::new(stream, conn.into(), Role::Inbound, peer))
    }

    /// 对出站连接执行客户端握手（包含证书验证）
    pub async fn connect(
        connector: &TlsConnector,
        server_name: ServerName<'static>,
        stream: TcpStream,
    ) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        let tls_stream = connector.connect(server_name, stream).await?;
        let (stream, conn) = tls_stream.into_inner();
        Ok(Self::new(stream, conn.into(), Role::Outbound, peer))
    }
}

#[async_trait]
impl Session for TlsSession {
    fn role(&self) -> Role {
        self.role
    }

    fn read(&mut self, buf: &mut [u8]) -> Outcome {
        if buf.is_empty() {
            return Outcome::WouldBlock;
        }

        loop {
            match self.conn.reader().read(buf) {
                // 只有收到 close_notify 且明文读完时才会返回 0
                Ok(0) => return Outcome::Closed,
                Ok(n) => {
                    self.buffered_plaintext = self.buffered_plaintext.saturating_sub(n);
                    return Outcome::Data(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                // 传输层 EOF 但没有 close_notify
                Err(e) => return Outcome::Fatal(e),
            }

            if self.eof {
                return Outcome::Fatal(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed connection without sending TLS close_notify",
                ));
            }

            match self.fill_from_socket() {
                Ok(true) => continue,
                Ok(false) => return Outcome::WouldBlock,
                Err(e) => return Outcome::Fatal(e),
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> Outcome {
        if data.is_empty() {
            return Outcome::WouldBlock;
        }

        loop {
            if self.accepted == 0 {
                match self.conn.writer().write(data) {
                    Ok(n) => self.accepted = n,
                    Err(e) => return Outcome::Fatal(e),
                }
            }

            match self.flush_tls() {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Outcome::WouldBlock,
                Err(e) => return Outcome::Fatal(e),
            }

            if self.accepted > 0 {
                return Outcome::Data(std::mem::take(&mut self.accepted));
            }
            // 发送缓冲区已满，清空后重新写入
        }
    }

    fn has_buffered_data(&self) -> bool {
        self.buffered_plaintext > 0 || self.peer_closed || self.eof
    }

    async fn readable(&self) -> io::Result<()> {
        self.stream.readable().await
    }

    async fn writable(&self) -> io::Result<()> {
        self.stream.writable().await
    }

    async fn shutdown(&mut self) {
        self.conn.send_close_notify();

        let result = tokio::time::timeout(self.shutdown_timeout, async {
            loop {
                match self.flush_tls() {
                    Ok(()) => break Ok(()),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        if let Err(e) = self.stream.writable().await {
                            break Err(e);
                        }
                    }
                    Err(e) => break Err(e),
                }
            }
        })
        .await;

        match result {
            Ok(Ok(())) => {
                if let Err(e) = self.stream.shutdown().await {
                    debug!(role = %self.role, peer = %self.peer, "TCP shutdown failed: {}", e);
                }
            }
            Ok(Err(e)) => {
                debug!(role = %self.role, peer = %self.peer, "Failed to send close_notify: {}", e);
            }
            Err(_) => {
                debug!(role = %self.role, peer = %self.peer, "Timed out sending close_notify");
            }
        }
    }
}
