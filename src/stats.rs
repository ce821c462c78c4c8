use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use crate::relay::Transferred;

/// Statistics snapshot for the relay
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Total number of accepted connections
    pub total_connections: u64,
    /// Currently active connections
    pub active_connections: u64,
    /// Connections rejected by the rate limiter
    pub rate_limited: u64,
    /// Failed inbound or outbound handshakes
    pub failed_handshakes: u64,
    /// Failed backend connects
    pub backend_connect_failures: u64,
    /// Total bytes relayed from clients to the backend
    pub bytes_client_to_backend: u64,
    /// Total bytes relayed from the backend to clients
    pub bytes_backend_to_client: u64,
    /// Timestamp when the relay started (Unix timestamp)
    pub start_time: u64,
}

#[derive(Debug, Default)]
struct Counters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rate_limited: AtomicU64,
    failed_handshakes: AtomicU64,
    backend_connect_failures: AtomicU64,
    bytes_client_to_backend: AtomicU64,
    bytes_backend_to_client: AtomicU64,
}

/// Statistics tracker shared by all relay instances
#[derive(Debug, Clone)]
pub struct RelayStats {
    counters: Arc<Counters>,
    start_time: u64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            start_time: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        }
    }

    /// Register a new connection; the returned guard marks it ended on drop
    pub fn connection_started(&self) -> ConnectionGuard {
        self.counters
            .total_connections
            .fetch_add(1, Ordering::Relaxed);
        self.counters
            .active_connections
            .fetch_add(1, Ordering::AcqRel);
        ConnectionGuard {
            stats: self.clone(),
        }
    }

    fn connection_ended(&self) {
        self.counters
            .active_connections
            .fetch_sub(1, Ordering::AcqRel);
    }

    pub fn record_rate_limited(&self) {
        self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handshake_failure(&self) {
        self.counters
            .failed_handshakes
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backend_connect_failure(&self) {
        self.counters
            .backend_connect_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Add the bytes moved by one relay instance
    pub fn add_transferred(&self, transferred: &Transferred) {
        self.counters
            .bytes_client_to_backend
            .fetch_add(transferred.client_to_backend, Ordering::Relaxed);
        self.counters
            .bytes_backend_to_client
            .fetch_add(transferred.backend_to_client, Ordering::Relaxed);
    }

    /// Currently active connections
    pub fn active_connections(&self) -> u64 {
        self.counters.active_connections.load(Ordering::Acquire)
    }

    /// Get current snapshot of stats
    pub fn snapshot(&self) -> StatsSnapshot {
        let c = &self.counters;
        StatsSnapshot {
            total_connections: c.total_connections.load(Ordering::Relaxed),
            active_connections: c.active_connections.load(Ordering::Acquire),
            rate_limited: c.rate_limited.load(Ordering::Relaxed),
            failed_handshakes: c.failed_handshakes.load(Ordering::Relaxed),
            backend_connect_failures: c.backend_connect_failures.load(Ordering::Relaxed),
            bytes_client_to_backend: c.bytes_client_to_backend.load(Ordering::Relaxed),
            bytes_backend_to_client: c.bytes_backend_to_client.load(Ordering::Relaxed),
            start_time: self.start_time,
        }
    }
}

impl Default for RelayStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that decrements the active connection count on drop
#[derive(Debug)]
pub struct ConnectionGuard {
    stats: RelayStats,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.stats.connection_ended();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_guard() {
        let stats = RelayStats::new();

        let first = stats.connection_started();
        let second = stats.connection_started();
        assert_eq!(stats.active_connections(), 2);

        drop(first);
        assert_eq!(stats.active_connections(), 1);
        drop(second);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_connections, 2);
        assert_eq!(snapshot.active_connections, 0);
    }

    #[test]
    fn test_counters_are_shared_between_clones() {
        let stats = RelayStats::new();
        let clone = stats.clone();

        clone.record_handshake_failure();
        clone.record_backend_connect_failure();
        clone.record_rate_limited();
        clone.add_transferred(&Transferred {
            client_to_backend: 10,
            backend_to_client: 32,
        });

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.failed_handshakes, 1);
        assert_eq!(snapshot.backend_connect_failures, 1);
        assert_eq!(snapshot.rate_limited, 1);
        assert_eq!(snapshot.bytes_client_to_backend, 10);
        assert_eq!(snapshot.bytes_backend_to_client, 32);
        assert!(snapshot.start_time > 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_string(&RelayStats::new().snapshot()).unwrap();
        assert!(json.contains("\"active_connections\":0"));
    }
}
