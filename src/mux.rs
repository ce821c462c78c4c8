/// 就绪多路复用
///
/// 同时等待客户端和后端两个会话，直到至少一方可读
use futures::FutureExt;
use std::io;
use std::time::Duration;

use crate::session::Session;

/// 一次等待得到的就绪集合
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub client: bool,
    pub backend: bool,
}

impl Readiness {
    /// 是否至少一方就绪
    pub fn any(&self) -> bool {
        self.client || self.backend
    }
}

/// 等待任一会话可读
///
/// 会话内部已有明文时直接返回，不等待传输层。唤醒后会再检查另一方，
/// 保证一次等待能报告所有就绪的会话
pub async fn wait<C, B>(client: &C, backend: &B) -> io::Result<Readiness>
where
    C: Session + ?Sized,
    B: Session + ?Sized,
{
    let buffered = Readiness {
        client: client.has_buffered_data(),
        backend: backend.has_buffered_data(),
    };
    if buffered.any() {
        return Ok(buffered);
    }

    // 固定先检查客户端，保证行为可复现
    let mut ready = tokio::select! {
        biased;
        result = client.readable() => {
            result?;
            Readiness { client: true, backend: false }
        }
        result = backend.readable() => {
            result?;
            Readiness { client: false, backend: true }
        }
    };

    if !ready.backend {
        if let Some(result) = backend.readable().now_or_never() {
            result?;
            ready.backend = true;
        }
    }
    if !ready.client {
        if let Some(result) = client.readable().now_or_never() {
            result?;
            ready.client = true;
        }
    }

    Ok(ready)
}

/// 带超时的等待；超时返回 `Ok(None)`
pub async fn wait_timeout<C, B>(
    client: &C,
    backend: &B,
    timeout: Option<Duration>,
) -> io::Result<Option<Readiness>>
where
    C: Session + ?Sized,
    B: Session + ?Sized,
{
    match timeout {
        Some(duration) => match tokio::time::timeout(duration, wait(client, backend)).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        },
        None => wait(client, backend).await.map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Outcome, Role};
    use async_trait::async_trait;

    /// 可控就绪状态的测试会话
    struct Probe {
        role: Role,
        readable: bool,
        buffered: bool,
        broken: bool,
    }

    impl Probe {
        fn new(role: Role) -> Self {
            Self {
                role,
                readable: false,
                buffered: false,
                broken: false,
            }
        }
    }

    #[async_trait]
    impl Session for Probe {
        fn role(&self) -> Role {
            self.role
        }

        fn read(&mut self, _buf: &mut [u8]) -> Outcome {
            Outcome::WouldBlock
        }

        fn write(&mut self, data: &[u8]) -> Outcome {
            Outcome::Data(data.len())
        }

        fn has_buffered_data(&self) -> bool {
            self.buffered
        }

        async fn readable(&self) -> io::Result<()> {
            if self.broken {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "bad handle"));
            }
            if self.readable {
                Ok(())
            } else {
                std::future::pending().await
            }
        }

        async fn writable(&self) -> io::Result<()> {
            Ok(())
        }

        async fn shutdown(&mut self) {}
    }

    #[tokio::test]
    async fn test_reports_both_ready_sides() {
        let mut client = Probe::new(Role::Inbound);
        let mut backend = Probe::new(Role::Outbound);
        client.readable = true;
        backend.readable = true;

        let ready = wait(&client, &backend).await.unwrap();
        assert_eq!(
            ready,
            Readiness {
                client: true,
                backend: true
            }
        );
    }

    #[tokio::test]
    async fn test_reports_single_ready_side() {
        let client = Probe::new(Role::Inbound);
        let mut backend = Probe::new(Role::Outbound);
        backend.readable = true;

        let ready = wait(&client, &backend).await.unwrap();
        assert!(!ready.client);
        assert!(ready.backend);
    }

    #[tokio::test]
    async fn test_buffered_data_skips_waiting() {
        let mut client = Probe::new(Role::Inbound);
        let backend = Probe::new(Role::Outbound);
        client.buffered = true;

        let ready = wait(&client, &backend).await.unwrap();
        assert!(ready.client);
        assert!(!ready.backend);
    }

    #[tokio::test]
    async fn test_wait_error_is_propagated() {
        let mut client = Probe::new(Role::Inbound);
        let backend = Probe::new(Role::Outbound);
        client.broken = true;

        let err = wait(&client, &backend).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_wait_timeout_expires() {
        let client = Probe::new(Role::Inbound);
        let backend = Probe::new(Role::Outbound);

        let result = wait_timeout(&client, &backend, Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_readiness_any() {
        assert!(!Readiness::default().any());
        assert!(Readiness {
            client: false,
            backend: true
        }
        .any());
    }
}
