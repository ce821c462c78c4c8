/// 速率限制器模块
///
/// 使用 token bucket 算法限制新连接的接入速率
use anyhow::{Context, Result};
use governor::{
    clock::{Clock, DefaultClock},
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RateLimitConfig;

/// 速率限制器包装器
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// 创建新的速率限制器
    pub fn new(config: &RateLimitConfig) -> Result<Self> {
        let rate = NonZeroU32::new(config.requests_per_second)
            .context("rate_limit.requests_per_second must be greater than 0")?;
        let burst = NonZeroU32::new(config.burst_size)
            .context("rate_limit.burst_size must be greater than 0")?;

        let quota = Quota::per_second(rate).allow_burst(burst);

        Ok(Self {
            inner: Arc::new(GovernorLimiter::direct(quota)),
            config: config.clone(),
        })
    }

    /// 尝试获取一个令牌（非阻塞）
    /// 返回 Ok(()) 如果允许连接，否则返回 Err(Duration) 表示需要等待的时间
    pub fn check(&self) -> std::result::Result<(), Duration> {
        match self.inner.check() {
            Ok(_) => Ok(()),
            Err(not_until) => Err(not_until.wait_time_from(DefaultClock::default().now())),
        }
    }

    /// 获取配置信息
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}
