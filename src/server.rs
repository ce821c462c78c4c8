use anyhow::{Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::RelayConfig;
use crate::lifecycle::{ConnectionController, RelayContext};
use crate::net::{self, AcceptErrorKind};
use crate::rate_limiter::RateLimiter;
use crate::stats::RelayStats;

/// 停机时等待连接拆除的最长时间
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

/// TLS 中继服务器
pub struct RelayServer {
    listener: TcpListener,
    ctx: Arc<RelayContext>,
    rate_limiter: Option<RateLimiter>,
}

impl RelayServer {
    /// 创建监听 socket（需要在 tokio 运行时中调用）
    pub fn bind(config: &RelayConfig, ctx: RelayContext) -> Result<Self> {
        let listener = net::bind_listener(&config.listen)?;
        let rate_limiter = config
            .rate_limit
            .as_ref()
            .map(RateLimiter::new)
            .transpose()?;

        if let Some(ref limiter) = rate_limiter {
            info!(
                "Connection rate limit: {} per second, burst {}",
                limiter.config().requests_per_second,
                limiter.config().burst_size
            );
        }

        Ok(Self {
            listener,
            ctx: Arc::new(ctx),
            rate_limiter,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to get listener address")
    }

    pub fn stats(&self) -> RelayStats {
        self.ctx.stats().clone()
    }

    /// 接受连接直到 `signal` 完成，然后通知所有中继停止并等待拆除
    pub async fn run_until<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let RelayServer {
            listener,
            ctx,
            rate_limiter,
        } = self;

        info!(
            "Relay listening on {} -> backend {}",
            listener.local_addr()?,
            ctx.backend_addr()
        );

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut tasks = JoinSet::new();
        let mut next_id: u64 = 0;

        tokio::pin!(signal);

        let result = loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("Received shutdown signal, stopping relay...");
                    break Ok(());
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("Connection task panicked: {}", e);
                        }
                    }
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => match net::classify_accept_error(&e) {
                            AcceptErrorKind::Retry => continue,
                            AcceptErrorKind::Backoff => {
                                warn!("Out of file descriptors, pausing accept: {}", e);
                                tokio::time::sleep(net::ACCEPT_BACKOFF).await;
                                continue;
                            }
                            AcceptErrorKind::Skip => {
                                debug!("Peer aborted before accept completed: {}", e);
                                continue;
                            }
                            AcceptErrorKind::Fatal => {
                                error!("Failed to accept connection: {}", e);
                                break Err(anyhow::Error::new(e).context("Listener failed"));
                            }
                        },
                    };

                    if let Some(ref limiter) = rate_limiter {
                        if limiter.check().is_err() {
                            ctx.stats().record_rate_limited();
                            warn!("Rate limit exceeded, dropping connection from {}", peer);
                            drop(stream);
                            continue;
                        }
                    }

                    next_id += 1;
                    let controller = ConnectionController::new(next_id, peer, Arc::clone(&ctx));
                    let shutdown = shutdown_tx.subscribe();
                    let span = info_span!("conn", id = next_id, peer = %peer);

                    tasks.spawn(
                        async move {
                            if let Err(e) = controller.run(stream, Some(shutdown)).await {
                                debug!("Connection ended with error: {}", e);
                            }
                        }
                        .instrument(span),
                    );
                }
            }
        };

        // 停止接受新连接
        drop(listener);

        if !tasks.is_empty() {
            info!("Waiting for {} active connections to close", tasks.len());
        }
        let _ = shutdown_tx.send(());
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "{} connections did not close within {:?}, aborting them",
                tasks.len(),
                DRAIN_TIMEOUT
            );
            tasks.shutdown().await;
        }

        let snapshot = ctx.stats().snapshot();
        info!(
            "Relay stopped: {}",
            serde_json::to_string(&snapshot).unwrap_or_default()
        );

        result
    }
}

/// 运行中继服务器，直到收到 Ctrl+C
pub async fn run_server(config: RelayConfig) -> Result<()> {
    let ctx = RelayContext::from_config(&config)?;
    let server = RelayServer::bind(&config, ctx)?;

    info!("Waiting for client connections... (Press Ctrl+C to stop)");

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls;
    use std::path::{Path, PathBuf};
    use tokio::net::TcpStream;

    fn temp_certs(tag: &str) -> (PathBuf, PathBuf) {
        let dir = std::env::temp_dir();
        let id = format!("{}-{}", tag, std::process::id());
        let cert = dir.join(format!("relay-server-cert-{}.pem", id));
        let key = dir.join(format!("relay-server-key-{}.pem", id));
        tls::generate_self_signed_cert("localhost", &[], &cert, &key).unwrap();
        (cert, key)
    }

    fn config(cert: &Path, key: &Path) -> RelayConfig {
        RelayConfig::builder()
            .listen_addr("127.0.0.1")
            .listen_port(0)
            .backend("127.0.0.1", 9)
            .backend_server_name("localhost")
            .cert_path(cert)
            .key_path(key)
            .rate_limit(1, 1)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_server_stops_on_signal() {
        let (cert, key) = temp_certs("stop");
        let config = config(&cert, &key);
        let ctx = RelayContext::from_config(&config).unwrap();
        let server = RelayServer::bind(&config, ctx).unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);

        let result = server.run_until(async {}).await;
        assert!(result.is_ok());

        let _ = std::fs::remove_file(cert);
        let _ = std::fs::remove_file(key);
    }

    #[tokio::test]
    async fn test_rate_limited_connections_are_dropped() {
        let (cert, key) = temp_certs("ratelimit");
        let config = config(&cert, &key);
        let ctx = RelayContext::from_config(&config).unwrap();
        let server = RelayServer::bind(&config, ctx).unwrap();
        let addr = server.local_addr().unwrap();
        let stats = server.stats();

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.run_until(async {
            let _ = stop_rx.await;
        }));

        // 突发容量为 1：第一个连接进入握手，后续连接被丢弃
        let first = TcpStream::connect(addr).await.unwrap();
        let second = TcpStream::connect(addr).await.unwrap();
        let third = TcpStream::connect(addr).await.unwrap();

        for _ in 0..50 {
            if stats.snapshot().rate_limited >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(stats.snapshot().rate_limited, 2);

        // 关闭后第一个连接的握手立即失败
        drop((first, second, third));
        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(stats.active_connections(), 0);

        let _ = std::fs::remove_file(cert);
        let _ = std::fs::remove_file(key);
    }
}
