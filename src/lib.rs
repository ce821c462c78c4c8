/// TLS Relay 库入口
///
/// 将核心模块导出为库，方便测试和复用
pub mod cli;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod mux;
pub mod net;
pub mod rate_limiter;
pub mod relay;
pub mod server;
pub mod session;
pub mod stats;
pub mod tls;

// 重新导出常用类型
pub use config::{RelayConfig, RelayConfigBuilder};
pub use error::{RelayError, Result};
pub use lifecycle::{ConnectionController, RelayContext};
pub use rate_limiter::RateLimiter;
pub use relay::{CloseReason, RelayExit, Transferred};
pub use server::{run_server, RelayServer};
pub use session::{Outcome, Role, Session, TlsSession};
pub use stats::{RelayStats, StatsSnapshot};
