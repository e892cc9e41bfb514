//! Test helpers for integration tests
//!
//! Builders for clients aimed at the fake gateway or a mocked REST API, and
//! polling helpers for state that changes on background tasks.

use crate::fake_gateway::{GatewaySession, STEP_TIMEOUT};
use anyhow::{anyhow, Context, Result};
use chatlink_gateway::{
    ConnectionManager, GatewayConfig, GatewayConnection, IdentifyRateLimiter, ShardEvent, Snowflake,
    StdIdentifyRateLimiter, VoiceConnection,
};
use chatlink_rest::{RestClient, RestConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

pub const TEST_TOKEN: &str = "Bot integration-token";

static TRACING: Once = Once::new();

/// Send client logs to the test output; `RUST_LOG` controls the level
pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// REST client for `server_uri`, usually a wiremock server
pub fn rest_client(server_uri: &str) -> RestClient {
    rest_client_with(RestConfig::new(TEST_TOKEN).with_api_base(format!("{server_uri}/api")))
}

pub fn rest_client_with(config: RestConfig) -> RestClient {
    RestClient::new(config).expect("REST client builds")
}

/// A gateway client and the receiving end of its event sink
pub struct TestClient {
    pub manager: ConnectionManager,
    pub events: mpsc::Receiver<ShardEvent>,
}

impl TestClient {
    /// Next event delivered to the sink
    pub async fn next_event(&mut self) -> Result<ShardEvent> {
        timeout(STEP_TIMEOUT, self.events.recv())
            .await
            .context("no event in time")?
            .ok_or_else(|| anyhow!("event sink closed"))
    }

    /// Skip events until `pred` matches
    pub async fn wait_event<F>(&mut self, pred: F) -> Result<ShardEvent>
    where
        F: Fn(&ShardEvent) -> bool,
    {
        loop {
            let event = self.next_event().await?;
            if pred(&event) {
                return Ok(event);
            }
        }
    }
}

/// Uncompressed client for the fake gateway at `url`
pub fn gateway_client(url: &str) -> TestClient {
    gateway_client_with(GatewayConfig::new(TEST_TOKEN).with_url(url).with_compress(false))
}

/// Client for an explicit config; identifies are spaced 10ms apart
pub fn gateway_client_with(config: GatewayConfig) -> TestClient {
    let limiter: Arc<dyn IdentifyRateLimiter> = Arc::new(StdIdentifyRateLimiter::new(Duration::from_millis(10)));
    gateway_client_parts(config, limiter, 64)
}

/// Client with its own identify limiter and an event sink holding `capacity` events
pub fn gateway_client_parts(
    config: GatewayConfig,
    limiter: Arc<dyn IdentifyRateLimiter>,
    capacity: usize,
) -> TestClient {
    init_test_tracing();

    // Port 1 is never listened on, so an accidental REST call fails fast
    let rest = rest_client("http://127.0.0.1:1");
    let (tx, events) = mpsc::channel(capacity);
    let manager = ConnectionManager::new(config, rest, limiter, Arc::new(tx));

    TestClient { manager, events }
}

/// Close the client while the server answers the close handshake
pub async fn close_both(manager: &ConnectionManager, session: &mut GatewaySession) -> Result<Option<u16>> {
    let ((), code) = tokio::join!(manager.close(), session.expect_close());
    code
}

/// Poll `check` until it holds
pub async fn eventually<F>(what: &str, check: F) -> Result<()>
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + STEP_TIMEOUT;
    while !check() {
        if Instant::now() >= deadline {
            return Err(anyhow!("timed out waiting for {what}"));
        }
        sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

/// Voice connection that only counts how often it was re-pointed
#[derive(Debug)]
pub struct RecordingVoice {
    guild_id: Snowflake,
    rebinds: AtomicUsize,
}

impl RecordingVoice {
    pub fn new(guild_id: Snowflake) -> Arc<Self> {
        Arc::new(Self {
            guild_id,
            rebinds: AtomicUsize::new(0),
        })
    }

    pub fn rebinds(&self) -> usize {
        self.rebinds.load(Ordering::SeqCst)
    }
}

impl VoiceConnection for RecordingVoice {
    fn guild_id(&self) -> Snowflake {
        self.guild_id
    }

    fn rebind(&self, _gateway: Weak<GatewayConnection>) {
        self.rebinds.fetch_add(1, Ordering::SeqCst);
    }
}
