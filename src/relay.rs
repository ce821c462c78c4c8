/// 中继循环
///
/// 在两个已握手的会话之间搬运明文，直到任一方关闭、出错或收到停机信号。
/// 循环本身不关闭连接，只把退出原因和传输字节数交还给调用者
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::config::{RelayOptions, MIN_BUFFER_SIZE};
use crate::mux;
use crate::session::{Outcome, Session};

/// 首行日志的最大字节数
pub const FIRST_LINE_LIMIT: usize = 256;

/// 中继缓冲区，两个方向轮流使用
pub struct RelayBuffer(Box<[u8]>);

impl RelayBuffer {
    /// 创建缓冲区；容量不小于 16 KiB
    pub fn new(size: usize) -> Self {
        Self(vec![0u8; size.max(MIN_BUFFER_SIZE)].into_boxed_slice())
    }

    pub fn capacity(&self) -> usize {
        self.0.len()
    }
}

impl Default for RelayBuffer {
    fn default() -> Self {
        Self::new(MIN_BUFFER_SIZE)
    }
}

/// 中继的一端
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Backend,
}

impl Side {
    /// 从该端读取的数据流向
    pub fn direction(self) -> Direction {
        match self {
            Side::Client => Direction::ClientToBackend,
            Side::Backend => Direction::BackendToClient,
        }
    }

    pub fn other(self) -> Side {
        match self {
            Side::Client => Side::Backend,
            Side::Backend => Side::Client,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Client => write!(f, "client"),
            Side::Backend => write!(f, "backend"),
        }
    }
}

/// 数据流向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToBackend,
    BackendToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToBackend => write!(f, "client->backend"),
            Direction::BackendToClient => write!(f, "backend->client"),
        }
    }
}

/// 中继循环状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Waiting,
    DrainingClient,
    DrainingBackend,
    Closing,
}

/// 中继结束的原因
#[derive(Debug)]
pub enum CloseReason {
    /// 对端发送 close_notify
    PeerClosed(Side),
    /// 读取失败（包括未发送 close_notify 的断开）
    ReadFailed { side: Side, error: io::Error },
    /// 写入失败
    WriteFailed { side: Side, error: io::Error },
    /// 写入时发现对端已关闭
    WriteClosed { side: Side },
    /// 写入连续阻塞超过重试上限
    WriteStalled { side: Side, attempts: u32 },
    /// 等待可写超时
    WriteTimeout { side: Side, waited: Duration },
    /// 等待就绪失败
    MuxError(io::Error),
    /// 空闲超时
    IdleTimeout(Duration),
    /// 进程停机
    Shutdown,
}

impl CloseReason {
    /// 是否属于异常结束
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            CloseReason::ReadFailed { .. }
                | CloseReason::WriteFailed { .. }
                | CloseReason::WriteStalled { .. }
                | CloseReason::WriteTimeout { .. }
                | CloseReason::MuxError(_)
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed(side) => write!(f, "{} closed the connection", side),
            CloseReason::ReadFailed { side, error } => {
                write!(f, "read from {} failed: {}", side, error)
            }
            CloseReason::WriteFailed { side, error } => {
                write!(f, "write to {} failed: {}", side, error)
            }
            CloseReason::WriteClosed { side } => write!(f, "{} closed while writing", side),
            CloseReason::WriteStalled { side, attempts } => {
                write!(f, "write to {} stalled after {} retries", side, attempts)
            }
            CloseReason::WriteTimeout { side, waited } => {
                write!(f, "{} not writable for {:?}", side, waited)
            }
            CloseReason::MuxError(e) => write!(f, "readiness wait failed: {}", e),
            CloseReason::IdleTimeout(d) => write!(f, "idle for {:?}", d),
            CloseReason::Shutdown => write!(f, "server shutting down"),
        }
    }
}

/// 各方向累计传输的字节数
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Transferred {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
}

impl Transferred {
    fn add(&mut self, direction: Direction, n: usize) {
        match direction {
            Direction::ClientToBackend => self.client_to_backend += n as u64,
            Direction::BackendToClient => self.backend_to_client += n as u64,
        }
    }

    pub fn total(&self) -> u64 {
        self.client_to_backend + self.backend_to_client
    }
}

/// 中继循环的结果
#[derive(Debug)]
pub struct RelayExit {
    pub reason: CloseReason,
    pub transferred: Transferred,
}

/// 提取数据的首行用于日志（不影响转发内容）
pub fn first_line(data: &[u8]) -> String {
    let head = &data[..data.len().min(FIRST_LINE_LIMIT)];
    let end = head.iter().position(|&b| b == b'\n').unwrap_or(head.len());
    String::from_utf8_lossy(&head[..end])
        .trim_end_matches('\r')
        .to_string()
}

/// 在两个会话之间双向转发数据
///
/// 每轮先处理客户端，再处理后端。`shutdown` 的发送端全部丢弃后不再监听停机信号
pub async fn relay<C, B>(
    client: &mut C,
    backend: &mut B,
    buffer: &mut RelayBuffer,
    options: &RelayOptions,
    mut shutdown: Option<broadcast::Receiver<()>>,
) -> RelayExit
where
    C: Session + ?Sized,
    B: Session + ?Sized,
{
    let idle_timeout = options.idle_timeout();
    let mut transferred = Transferred::default();
    let mut peeked = !options.peek_first_line;
    let mut state = RelayState::Waiting;

    let reason = loop {
        let waited = tokio::select! {
            biased;
            _ = shutdown_signal(&mut shutdown) => {
                enter(&mut state, RelayState::Closing);
                break CloseReason::Shutdown;
            }
            result = mux::wait_timeout(&*client, &*backend, idle_timeout) => result,
        };

        let ready = match waited {
            Ok(Some(ready)) => ready,
            Ok(None) => {
                enter(&mut state, RelayState::Closing);
                break CloseReason::IdleTimeout(idle_timeout.unwrap_or_default());
            }
            Err(e) => {
                enter(&mut state, RelayState::Closing);
                break CloseReason::MuxError(e);
            }
        };

        if ready.client {
            enter(&mut state, RelayState::DrainingClient);
            let pumped = pump(
                &mut *client,
                &mut *backend,
                Side::Client,
                buffer,
                options,
                &mut shutdown,
            )
            .await;
            match pumped {
                Ok(Some(n)) => {
                    transferred.add(Direction::ClientToBackend, n);
                    if !peeked {
                        peeked = true;
                        debug!(first_line = %first_line(&buffer.0[..n]), "client request");
                    }
                }
                Ok(None) => {}
                Err(reason) => {
                    enter(&mut state, RelayState::Closing);
                    break reason;
                }
            }
        }

        if ready.backend {
            enter(&mut state, RelayState::DrainingBackend);
            let pumped = pump(
                &mut *backend,
                &mut *client,
                Side::Backend,
                buffer,
                options,
                &mut shutdown,
            )
            .await;
            match pumped {
                Ok(Some(n)) => transferred.add(Direction::BackendToClient, n),
                Ok(None) => {}
                Err(reason) => {
                    enter(&mut state, RelayState::Closing);
                    break reason;
                }
            }
        }

        enter(&mut state, RelayState::Waiting);
    };

    debug_assert_eq!(state, RelayState::Closing);
    debug!(
        "Relay closing: {} ({} bytes client->backend, {} bytes backend->client)",
        reason, transferred.client_to_backend, transferred.backend_to_client
    );

    RelayExit {
        reason,
        transferred,
    }
}

fn enter(state: &mut RelayState, next: RelayState) {
    trace!("relay state {:?} -> {:?}", state, next);
    *state = next;
}

/// 等待停机信号；发送端全部关闭后永远挂起
async fn shutdown_signal(shutdown: &mut Option<broadcast::Receiver<()>>) {
    loop {
        match shutdown {
            Some(rx) => match rx.recv().await {
                Err(broadcast::error::RecvError::Closed) => *shutdown = None,
                _ => return,
            },
            None => std::future::pending::<()>().await,
        }
    }
}

/// 从 `from` 读取一次并完整写入 `to`
///
/// 返回 `Ok(None)` 表示读取阻塞，`Ok(Some(n))` 表示转发了 n 字节
async fn pump<R, W>(
    from: &mut R,
    to: &mut W,
    side: Side,
    buffer: &mut RelayBuffer,
    options: &RelayOptions,
    shutdown: &mut Option<broadcast::Receiver<()>>,
) -> Result<Option<usize>, CloseReason>
where
    R: Session + ?Sized,
    W: Session + ?Sized,
{
    let n = match from.read(&mut buffer.0) {
        Outcome::Data(n) => n,
        Outcome::WouldBlock => return Ok(None),
        Outcome::Closed => return Err(CloseReason::PeerClosed(side)),
        Outcome::Fatal(error) => return Err(CloseReason::ReadFailed { side, error }),
    };

    trace!("data {} {} bytes", side.direction(), n);

    write_all(to, &buffer.0[..n], side.other(), options, shutdown).await?;

    Ok(Some(n))
}

/// 写入全部数据；阻塞时等待可写并用相同数据重试
///
/// 连续重试超过上限、单次等待超过 `write_timeout` 或收到停机信号时放弃
async fn write_all<W>(
    to: &mut W,
    data: &[u8],
    side: Side,
    options: &RelayOptions,
    shutdown: &mut Option<broadcast::Receiver<()>>,
) -> Result<(), CloseReason>
where
    W: Session + ?Sized,
{
    let retry_limit = options.write_retry_limit;
    let write_timeout = options.write_timeout();
    let mut offset = 0;
    let mut retries = 0u32;

    while offset < data.len() {
        match to.write(&data[offset..]) {
            Outcome::Data(n) => {
                offset += n;
                retries = 0;
            }
            Outcome::WouldBlock => {
                if retries >= retry_limit {
                    return Err(CloseReason::WriteStalled {
                        side,
                        attempts: retries,
                    });
                }
                retries += 1;

                let waited = tokio::select! {
                    biased;
                    _ = shutdown_signal(shutdown) => return Err(CloseReason::Shutdown),
                    result = tokio::time::timeout(write_timeout, to.writable()) => result,
                };
                match waited {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => return Err(CloseReason::WriteFailed { side, error }),
                    Err(_) => {
                        return Err(CloseReason::WriteTimeout {
                            side,
                            waited: write_timeout,
                        })
                    }
                }
            }
            Outcome::Closed => return Err(CloseReason::WriteClosed { side }),
            Outcome::Fatal(error) => return Err(CloseReason::WriteFailed { side, error }),
        }
    }

    Ok(())
}
