//! Identify rate limiting
//!
//! The platform allows one Identify per few seconds per bot, across all shards.
//! The process root builds one limiter and hands it to every manager.

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::fmt;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_IDENTIFY_INTERVAL: Duration = Duration::from_secs(5);

#[async_trait]
pub trait IdentifyRateLimiter: Send + Sync + fmt::Debug + 'static {
    /// Resolve once `shard_id` may send Identify
    async fn wait(&self, shard_id: u32);
}

/// One Identify per period, shared by every shard holding it
pub struct StdIdentifyRateLimiter {
    limiter: DefaultDirectRateLimiter,
    period: Duration,
}

impl StdIdentifyRateLimiter {
    #[must_use]
    pub fn new(period: Duration) -> Self {
        let quota = Quota::with_period(period).unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN));
        Self {
            limiter: RateLimiter::direct(quota),
            period,
        }
    }

    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }
}

impl Default for StdIdentifyRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_IDENTIFY_INTERVAL)
    }
}

impl fmt::Debug for StdIdentifyRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StdIdentifyRateLimiter")
            .field("period", &self.period)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl IdentifyRateLimiter for StdIdentifyRateLimiter {
    async fn wait(&self, shard_id: u32) {
        if self.limiter.check().is_ok() {
            return;
        }
        debug!(shard_id, period_ms = self.period.as_millis() as u64, "Waiting for identify slot");
        self.limiter.until_ready().await;
    }
}
