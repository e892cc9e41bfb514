//! Gateway client entry point
//!
//! Run with:
//! ```bash
//! CHATLINK_TOKEN="Bot ..." cargo run -p chatlink-gateway
//! ```
//!
//! Configuration is loaded from environment variables.

use anyhow::Context;
use chatlink_common::{try_init_tracing_with_config, ClientConfig, TracingConfig};
use chatlink_gateway::{
    EventSink, GatewayConfig, GatewayEvent, IdentifyRateLimiter, ShardEvent, ShardSupervisor, StdIdentifyRateLimiter,
};
use chatlink_rest::{RestClient, RestConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const EVENT_BUFFER: usize = 256;

#[tokio::main]
async fn main() {
    let config = match ClientConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = try_init_tracing_with_config(TracingConfig::for_environment(config.env)) {
        eprintln!("Warning: Failed to initialize tracing: {e}");
    }

    if let Err(e) = run(config).await {
        error!(error = %e, "Gateway client failed");
        std::process::exit(1);
    }
}

async fn run(config: ClientConfig) -> anyhow::Result<()> {
    info!(
        env = ?config.env,
        shard_count = config.gateway.shard_count,
        compress = config.gateway.compress,
        "Configuration loaded"
    );

    let rest = RestClient::new(RestConfig::from_settings(config.token.clone(), &config.rest))
        .context("failed to build REST client")?;
    let limiter: Arc<dyn IdentifyRateLimiter> = Arc::new(StdIdentifyRateLimiter::new(Duration::from_millis(
        config.gateway.identify_interval_ms,
    )));
    let (tx, mut rx) = mpsc::channel::<ShardEvent>(EVENT_BUFFER);
    let sink: Arc<dyn EventSink> = Arc::new(tx);

    let supervisor = ShardSupervisor::new(
        GatewayConfig::from_settings(config.token, &config.gateway),
        rest,
        limiter,
        sink,
    )
    .await
    .context("failed to plan shards")?;

    supervisor.start_all().await.context("failed to start shards")?;
    info!(shards = supervisor.shard_count(), "All shards started");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            event = rx.recv() => match event {
                Some(event) => log_event(&event),
                None => break,
            },
        }
    }

    supervisor.stop_all().await.context("a shard stopped on a fatal error")?;
    Ok(())
}

fn log_event(event: &ShardEvent) {
    match &event.event {
        GatewayEvent::Connected => info!(shard_id = event.shard_id, "Shard connected"),
        GatewayEvent::Disconnected => warn!(shard_id = event.shard_id, "Shard disconnected"),
        GatewayEvent::Dispatch(dispatch) => {
            info!(shard_id = event.shard_id, event = %dispatch.kind(), "Dispatch");
        }
    }
}
