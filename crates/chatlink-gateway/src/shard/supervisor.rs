//! One manager per shard
//!
//! All shards share one REST client, one identify limiter and one event sink.

use crate::connection::{ConnectionManager, GatewayConfig, GatewayStatus, IdentifyRateLimiter};
use crate::error::{FatalError, GatewayError};
use crate::events::{EventRegistry, EventSink};
use crate::protocol::Snowflake;
use chatlink_rest::RestClient;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug)]
pub struct ShardSupervisor {
    managers: Vec<ConnectionManager>,
}

impl ShardSupervisor {
    /// Build a manager for every shard
    ///
    /// A shard count of 0 in `base` means "use the count recommended by
    /// `GET /gateway/bot`". The URL from that response is reused so shards
    /// don't each resolve it again.
    pub async fn new(
        mut base: GatewayConfig,
        rest: RestClient,
        identify_limiter: Arc<dyn IdentifyRateLimiter>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, GatewayError> {
        let shard_count = if base.shard_count == 0 {
            let bot = rest.gateway_bot().await?;
            info!(shards = bot.shards, url = %bot.url, "Using recommended shard count");
            if base.url_override.is_none() {
                base.url_override = Some(bot.url);
            }
            bot.shards.max(1)
        } else {
            base.shard_count
        };

        Ok(Self::with_shard_count(base, shard_count, &rest, &identify_limiter, &sink))
    }

    fn with_shard_count(
        base: GatewayConfig,
        shard_count: u32,
        rest: &RestClient,
        identify_limiter: &Arc<dyn IdentifyRateLimiter>,
        sink: &Arc<dyn EventSink>,
    ) -> Self {
        let registry = Arc::new(EventRegistry::standard());
        let managers = (0..shard_count)
            .map(|shard_id| {
                ConnectionManager::with_registry(
                    base.clone().with_shard(shard_id, shard_count),
                    rest.clone(),
                    Arc::clone(identify_limiter),
                    Arc::clone(sink),
                    Arc::clone(&registry),
                )
            })
            .collect();

        Self { managers }
    }

    #[must_use]
    pub fn shard_count(&self) -> u32 {
        self.managers.len() as u32
    }

    #[must_use]
    pub fn managers(&self) -> &[ConnectionManager] {
        &self.managers
    }

    #[must_use]
    pub fn shard(&self, shard_id: u32) -> Option<&ConnectionManager> {
        self.managers.get(shard_id as usize)
    }

    /// The shard that receives events for `guild_id`
    #[must_use]
    pub fn shard_for_guild(&self, guild_id: Snowflake) -> Option<&ConnectionManager> {
        self.shard(guild_id.shard_for(self.shard_count()))
    }

    /// Open every shard in order, stopping at the first failure
    ///
    /// Identify pacing comes from the shared limiter, not from here.
    pub async fn start_all(&self) -> Result<(), GatewayError> {
        for manager in &self.managers {
            info!(shard_id = manager.shard_id(), "Starting shard");
            manager.open().await.inspect_err(|e| {
                error!(shard_id = manager.shard_id(), error = %e, "Failed to start shard");
            })?;
        }
        Ok(())
    }

    /// Close every shard, reporting the last fatal error any of them latched
    pub async fn stop_all(&self) -> Result<(), GatewayError> {
        let mut last_fatal: Option<FatalError> = None;
        for manager in &self.managers {
            manager.close().await;
            if let Some(fatal) = manager.fatal_error() {
                last_fatal = Some(fatal);
            }
        }

        match last_fatal {
            Some(fatal) => Err(fatal.into()),
            None => Ok(()),
        }
    }

    #[must_use]
    pub fn statuses(&self) -> Vec<(u32, GatewayStatus)> {
        self.managers
            .iter()
            .map(|manager| (manager.shard_id(), manager.status()))
            .collect()
    }
}
