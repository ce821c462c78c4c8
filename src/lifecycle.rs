/// 单个客户端连接的生命周期
///
/// accept → 入站握手 → 连接后端 → 出站握手 → 中继 → 拆除。
/// 每个阶段都有超时；任何阶段失败都直接进入拆除，已打开的连接随所有权一起释放
use anyhow::Context;
use rustls::pki_types::ServerName;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_rustls::{rustls, TlsAcceptor, TlsConnector};
use tracing::{debug, info, trace, warn};

use crate::config::{RelayConfig, RelayOptions};
use crate::error::{RelayError, Result, Stage};
use crate::net;
use crate::relay::{self, RelayBuffer, RelayExit};
use crate::session::{Role, Session, TlsSession};
use crate::stats::RelayStats;
use crate::tls;

/// 所有连接共享的只读上下文
#[derive(Clone)]
pub struct RelayContext {
    acceptor: TlsAcceptor,
    connector: TlsConnector,
    backend_addr: String,
    server_name: ServerName<'static>,
    handshake_timeout: Duration,
    connect_timeout: Duration,
    options: RelayOptions,
    stats: RelayStats,
}

impl RelayContext {
    /// 根据配置加载证书并构建上下文
    pub fn from_config(config: &RelayConfig) -> anyhow::Result<Self> {
        let (server_config, client_config) =
            tls::load_relay_tls(&config.tls).context("Failed to load TLS configuration")?;
        Self::new(server_config, client_config, config)
    }

    /// 使用已构建的 TLS 配置创建上下文
    pub fn new(
        server_config: Arc<rustls::ServerConfig>,
        client_config: Arc<rustls::ClientConfig>,
        config: &RelayConfig,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            acceptor: TlsAcceptor::from(server_config),
            connector: TlsConnector::from(client_config),
            backend_addr: config.backend.socket_addr(),
            server_name: tls::backend_server_name(&config.backend)?,
            handshake_timeout: config.tls.handshake_timeout(),
            connect_timeout: config.backend.connect_timeout(),
            options: config.relay.clone(),
            stats: RelayStats::new(),
        })
    }

    /// 使用外部提供的统计对象
    pub fn with_stats(mut self, stats: RelayStats) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    pub fn backend_addr(&self) -> &str {
        &self.backend_addr
    }

    pub fn options(&self) -> &RelayOptions {
        &self.options
    }
}

/// 连接生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Accepted,
    InboundHandshaking,
    OutboundConnecting,
    OutboundHandshaking,
    Relaying,
    TornDown,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Accepted => "accepted",
            LifecycleState::InboundHandshaking => "inbound-handshaking",
            LifecycleState::OutboundConnecting => "outbound-connecting",
            LifecycleState::OutboundHandshaking => "outbound-handshaking",
            LifecycleState::Relaying => "relaying",
            LifecycleState::TornDown => "torn-down",
        };
        write!(f, "{}", name)
    }
}

/// 单个连接的控制器
pub struct ConnectionController {
    id: u64,
    peer: SocketAddr,
    ctx: Arc<RelayContext>,
    state: LifecycleState,
}

impl ConnectionController {
    pub fn new(id: u64, peer: SocketAddr, ctx: Arc<RelayContext>) -> Self {
        Self {
            id,
            peer,
            ctx,
            state: LifecycleState::Accepted,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    fn transition(&mut self, next: LifecycleState) {
        trace!("connection {} state {} -> {}", self.id, self.state, next);
        self.state = next;
    }

    /// 处理一个已 accept 的连接，直到拆除完成
    pub async fn run(
        mut self,
        stream: TcpStream,
        shutdown: Option<broadcast::Receiver<()>>,
    ) -> Result<RelayExit> {
        let ctx = Arc::clone(&self.ctx);
        let _guard = ctx.stats.connection_started();

        info!("accepted: {}", self.peer);
        net::tune_stream(&stream);

        // 入站握手；超时或失败时 stream 随 future 一起释放
        self.transition(LifecycleState::InboundHandshaking);
        let accepted = timeout(
            ctx.handshake_timeout,
            TlsSession::accept(&ctx.acceptor, stream, self.peer),
        )
        .await;
        let client = match accepted {
            Ok(Ok(session)) => session.with_shutdown_timeout(ctx.options.shutdown_timeout()),
            Ok(Err(e)) => {
                ctx.stats.record_handshake_failure();
                warn!(role = %Role::Inbound, "handshake_fail: {}", e);
                self.transition(LifecycleState::TornDown);
                return Err(RelayError::inbound_handshake(self.peer, e));
            }
            Err(_) => {
                ctx.stats.record_handshake_failure();
                warn!(role = %Role::Inbound, "handshake_fail: timed out");
                self.transition(LifecycleState::TornDown);
                return Err(RelayError::timeout(
                    Stage::InboundHandshake,
                    ctx.handshake_timeout,
                ));
            }
        };
        info!(
            role = %Role::Inbound,
            "handshake_ok: {:?}",
            client.protocol_version()
        );

        // 连接后端
        self.transition(LifecycleState::OutboundConnecting);
        let connected = timeout(ctx.connect_timeout, TcpStream::connect(&ctx.backend_addr)).await;
        let backend_stream = match connected {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                ctx.stats.record_backend_connect_failure();
                warn!("backend_connect_fail: {}: {}", ctx.backend_addr, e);
                self.teardown(None, client).await;
                return Err(RelayError::backend_connect(&ctx.backend_addr, e));
            }
            Err(_) => {
                ctx.stats.record_backend_connect_failure();
                warn!("backend_connect_fail: {}: timed out", ctx.backend_addr);
                self.teardown(None, client).await;
                return Err(RelayError::timeout(
                    Stage::BackendConnect,
                    ctx.connect_timeout,
                ));
            }
        };
        info!("backend_connect_ok: {}", ctx.backend_addr);
        net::tune_stream(&backend_stream);

        // 出站握手（验证后端证书）
        self.transition(LifecycleState::OutboundHandshaking);
        let handshaked = timeout(
            ctx.handshake_timeout,
            TlsSession::connect(&ctx.connector, ctx.server_name.clone(), backend_stream),
        )
        .await;
        let backend = match handshaked {
            Ok(Ok(session)) => session.with_shutdown_timeout(ctx.options.shutdown_timeout()),
            Ok(Err(e)) => {
                ctx.stats.record_handshake_failure();
                warn!(role = %Role::Outbound, "handshake_fail: {}", e);
                self.teardown(None, client).await;
                return Err(RelayError::outbound_handshake(&ctx.backend_addr, e));
            }
            Err(_) => {
                ctx.stats.record_handshake_failure();
                warn!(role = %Role::Outbound, "handshake_fail: timed out");
                self.teardown(None, client).await;
                return Err(RelayError::timeout(
                    Stage::OutboundHandshake,
                    ctx.handshake_timeout,
                ));
            }
        };
        info!(
            role = %Role::Outbound,
            "handshake_ok: {:?}",
            backend.protocol_version()
        );

        // 中继
        self.transition(LifecycleState::Relaying);
        let mut client = client;
        let mut backend = backend;
        let mut buffer = RelayBuffer::new(ctx.options.buffer_size);
        let exit = relay::relay(
            &mut client,
            &mut backend,
            &mut buffer,
            &ctx.options,
            shutdown,
        )
        .await;

        ctx.stats.add_transferred(&exit.transferred);
        if exit.reason.is_error() {
            warn!(
                "closed: {} ({} bytes client->backend, {} bytes backend->client)",
                exit.reason, exit.transferred.client_to_backend, exit.transferred.backend_to_client
            );
        } else {
            info!(
                "closed: {} ({} bytes client->backend, {} bytes backend->client)",
                exit.reason, exit.transferred.client_to_backend, exit.transferred.backend_to_client
            );
        }

        self.teardown(Some(backend), client).await;
        Ok(exit)
    }

    /// 拆除连接：先后端再客户端，各自 shutdown 后关闭
    async fn teardown(&mut self, backend: Option<TlsSession>, mut client: TlsSession) {
        if let Some(mut backend) = backend {
            backend.shutdown().await;
            backend.close();
        }
        client.shutdown().await;
        client.close();

        self.transition(LifecycleState::TornDown);
        debug!("connection {} torn down", self.id);
    }
}
