//! Common utilities for integration tests
#![allow(dead_code)]

use rustls::pki_types::ServerName;
use std::future::Future;
use std::net::{SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tls_relay::stats::RelayStats;
use tls_relay::{tls, RelayConfig, RelayContext, RelayServer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};

/// Find an available port
pub fn get_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to random port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// Generate temporary certificate files for testing
pub fn generate_test_certs() -> (PathBuf, PathBuf) {
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let temp_dir = std::env::temp_dir();
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64;
    let counter = COUNTER.fetch_add(1, Ordering::SeqCst);
    let unique_id = format!("{}-{}-{}", timestamp, counter, std::process::id());

    let cert_path = temp_dir.join(format!("relay-test-cert-{}.pem", unique_id));
    let key_path = temp_dir.join(format!("relay-test-key-{}.pem", unique_id));

    tls::generate_self_signed_cert(
        "localhost",
        &["127.0.0.1".to_string(), "localhost".to_string()],
        &cert_path,
        &key_path,
    )
    .expect("Failed to generate test certificates");

    (cert_path, key_path)
}

/// Relay configuration pointing at a local backend
pub fn relay_config(cert: &Path, key: &Path, backend_port: u16) -> RelayConfig {
    RelayConfig::builder()
        .listen_addr("127.0.0.1")
        .listen_port(0)
        .backend("127.0.0.1", backend_port)
        .cert_path(cert)
        .key_path(key)
        .handshake_timeout(Duration::from_secs(5))
        .connect_timeout(Duration::from_secs(2))
        .build()
        .expect("Invalid relay configuration")
}

/// A running relay server
pub struct RelayHandle {
    pub addr: SocketAddr,
    pub stats: RelayStats,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl RelayHandle {
    /// Signal shutdown and wait for the server to finish
    pub async fn stop(mut self) -> anyhow::Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        (&mut self.task).await.expect("Relay task panicked")
    }
}

/// Start a relay server on an ephemeral port
pub async fn start_relay(config: RelayConfig) -> RelayHandle {
    let ctx = RelayContext::from_config(&config).expect("Failed to load relay TLS");
    let server = RelayServer::bind(&config, ctx).expect("Failed to bind relay");
    let addr = server.local_addr().expect("Failed to get relay address");
    let stats = server.stats();

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(server.run_until(async {
        let _ = stop_rx.await;
    }));

    RelayHandle {
        addr,
        stats,
        stop: Some(stop_tx),
        task,
    }
}

/// Start a TLS backend running `handler` for every accepted connection
pub async fn start_tls_backend<F, Fut>(
    port: u16,
    cert: &Path,
    key: &Path,
    handler: F,
) -> JoinHandle<()>
where
    F: Fn(server::TlsStream<TcpStream>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let acceptor = TlsAcceptor::from(
        tls::load_server_config(cert, key).expect("Failed to load backend TLS config"),
    );
    let listener = TokioTcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .expect("Failed to bind backend");
    let handler = Arc::new(handler);

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let acceptor = acceptor.clone();
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                if let Ok(stream) = acceptor.accept(socket).await {
                    handler(stream).await;
                }
            });
        }
    })
}

/// Create a TLS echo backend for testing
pub async fn start_tls_echo_backend(port: u16, cert: &Path, key: &Path) -> JoinHandle<()> {
    start_tls_backend(port, cert, key, |mut stream| async move {
        let mut buf = vec![0u8; 8192];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                    if stream.flush().await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = stream.shutdown().await;
    })
    .await
}

/// Connect a TLS client that trusts `ca`
pub async fn connect_client(addr: SocketAddr, ca: &Path) -> client::TlsStream<TcpStream> {
    let connector = TlsConnector::from(
        tls::load_client_config(Some(ca), false, false).expect("Failed to load client TLS"),
    );
    let stream = TcpStream::connect(addr)
        .await
        .expect("Failed to connect to relay");
    let name = ServerName::try_from("localhost").unwrap().to_owned();
    connector
        .connect(name, stream)
        .await
        .expect("Client TLS handshake failed")
}

/// Send `data` and read the same number of bytes back
pub async fn echo_roundtrip(stream: &mut client::TlsStream<TcpStream>, data: &[u8]) -> Vec<u8> {
    stream.write_all(data).await.expect("Failed to write");
    stream.flush().await.expect("Failed to flush");
    let mut response = vec![0u8; data.len()];
    stream
        .read_exact(&mut response)
        .await
        .expect("Failed to read echo");
    response
}

/// Wait until `predicate` returns true
pub async fn wait_until<F>(mut predicate: F, max_wait: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + max_wait;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    predicate()
}

/// Number of open file descriptors of this process (Linux only)
pub fn open_fd_count() -> Option<usize> {
    std::fs::read_dir("/proc/self/fd")
        .ok()
        .map(|entries| entries.count())
}

/// Random payload of `len` bytes
pub fn random_payload(len: usize) -> Vec<u8> {
    use rand::RngCore;

    let mut data = vec![0u8; len];
    rand::rng().fill_bytes(&mut data);
    data
}

/// Cleanup function for test resources
pub struct TestCleanup {
    cert_path: Option<PathBuf>,
    key_path: Option<PathBuf>,
}

impl TestCleanup {
    pub fn new(cert_path: PathBuf, key_path: PathBuf) -> Self {
        Self {
            cert_path: Some(cert_path),
            key_path: Some(key_path),
        }
    }
}

impl Drop for TestCleanup {
    fn drop(&mut self) {
        if let Some(cert) = self.cert_path.take() {
            let _ = std::fs::remove_file(cert);
        }
        if let Some(key) = self.key_path.take() {
            let _ = std::fs::remove_file(key);
        }
    }
}
