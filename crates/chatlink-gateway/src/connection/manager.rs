//! Connection manager
//!
//! Long-lived state for one shard: the cached gateway URL, the session needed
//! to resume, the fatal latch and the registry of voice connections. Each
//! open replaces the current [`GatewayConnection`] with a new one.

use super::connection::{GatewayConnection, GatewayStatus};
use super::identify::IdentifyRateLimiter;
use super::voice::VoiceConnection;
use crate::error::{FatalError, GatewayError};
use crate::events::{EventRegistry, EventSink};
use crate::protocol::{Intents, RequestGuildMembersData, Snowflake, UpdateStatusData, VoiceStateUpdatePayload};
use chatlink_common::GatewaySettings;
use chatlink_rest::RestClient;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Per-shard gateway settings
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub token: String,
    /// Used instead of asking the REST API when set
    pub url_override: Option<String>,
    pub api_version: u8,
    pub shard_id: u32,
    /// Values below 1 are treated as 1
    pub shard_count: u32,
    pub intents: Intents,
    /// Request zlib-stream transport compression
    pub compress: bool,
    pub large_threshold: u32,
    /// Consecutive unacknowledged heartbeats tolerated before reconnecting
    pub max_missed_acks: u32,
}

impl GatewayConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            url_override: None,
            api_version: 10,
            shard_id: 0,
            shard_count: 1,
            intents: Intents::default(),
            compress: true,
            large_threshold: 250,
            max_missed_acks: 1,
        }
    }

    pub fn from_settings(token: impl Into<String>, settings: &GatewaySettings) -> Self {
        Self {
            url_override: settings.url_override.clone(),
            api_version: settings.api_version,
            shard_count: settings.shard_count,
            intents: Intents::from_bits_retain(settings.intents),
            compress: settings.compress,
            large_threshold: settings.large_threshold,
            max_missed_acks: settings.max_missed_acks,
            ..Self::new(token)
        }
    }

    #[must_use]
    pub fn with_shard(mut self, shard_id: u32, shard_count: u32) -> Self {
        self.shard_id = shard_id;
        self.shard_count = shard_count;
        self
    }

    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url_override = Some(url.into());
        self
    }

    #[must_use]
    pub fn with_intents(mut self, intents: Intents) -> Self {
        self.intents = intents;
        self
    }

    #[must_use]
    pub fn with_compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }
}

/// What the next open needs to resume
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: Option<String>,
    pub sequence: u64,
    pub resume_url: Option<String>,
}

#[derive(Default)]
struct ManagerState {
    gateway_url: Option<String>,
    session: SessionInfo,
    current: Option<Arc<GatewayConnection>>,
    voice: HashMap<Snowflake, Arc<dyn VoiceConnection>>,
    fatal: Option<FatalError>,
}

pub(super) struct ManagerInner {
    pub(super) config: Arc<GatewayConfig>,
    rest: RestClient,
    pub(super) identify_limiter: Arc<dyn IdentifyRateLimiter>,
    pub(super) sink: Arc<dyn EventSink>,
    pub(super) registry: Arc<EventRegistry>,
    /// Serializes opens; close never takes it so it can interrupt a dial
    open_lock: tokio::sync::Mutex<()>,
    state: Mutex<ManagerState>,
    conn_counter: AtomicU64,
}

impl ManagerInner {
    async fn open(self: &Arc<Self>) -> Result<(), GatewayError> {
        let _open = self.open_lock.lock().await;

        let latched = self.state.lock().fatal;
        if let Some(fatal) = latched {
            return Err(fatal.into());
        }

        // Validated before the live connection is touched
        let shard_id = self.config.shard_id;
        let shard_count = self.config.shard_count.max(1);
        if shard_id >= shard_count {
            return Err(GatewayError::InvalidShard {
                id: shard_id,
                count: shard_count,
            });
        }

        let previous = self.state.lock().current.take();
        if let Some(previous) = previous {
            previous.close().await;
        }

        let conn_id = self.conn_counter.fetch_add(1, Ordering::AcqRel) + 1;

        let gateway_url = self.gateway_url().await?;
        let conn = GatewayConnection::new(conn_id, shard_count, self);
        let session = {
            let mut state = self.state.lock();
            state.current = Some(Arc::clone(&conn));
            state.session.clone()
        };

        info!(
            shard_id,
            conn_id,
            resuming = session.session_id.is_some(),
            "Opening gateway connection"
        );
        conn.open(&gateway_url, session).await?;

        let state = self.state.lock();
        for voice in state.voice.values() {
            voice.rebind(Arc::downgrade(&conn));
        }
        Ok(())
    }

    async fn gateway_url(&self) -> Result<String, GatewayError> {
        let cached = self.state.lock().gateway_url.clone();
        if let Some(url) = cached {
            return Ok(url);
        }

        let url = match &self.config.url_override {
            Some(url) if url.ends_with('/') => url.clone(),
            Some(url) => format!("{url}/"),
            None => self.rest.gateway().await?,
        };
        self.state.lock().gateway_url = Some(url.clone());
        Ok(url)
    }

    /// First fatal close wins; later ones are ignored
    pub(super) fn latch_fatal(&self, fatal: FatalError) {
        let mut state = self.state.lock();
        if state.fatal.is_none() {
            state.fatal = Some(fatal);
        }
    }

    pub(super) fn store_session(&self, session_id: Option<String>, sequence: u64, resume_url: Option<String>) {
        self.state.lock().session = SessionInfo {
            session_id,
            sequence,
            resume_url,
        };
    }
}

/// Owns the gateway lifecycle of one shard
///
/// Cheap to clone; clones drive the same shard.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(
        config: GatewayConfig,
        rest: RestClient,
        identify_limiter: Arc<dyn IdentifyRateLimiter>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self::with_registry(config, rest, identify_limiter, sink, Arc::new(EventRegistry::standard()))
    }

    /// Like [`Self::new`] with a caller-built dispatch registry
    pub fn with_registry(
        config: GatewayConfig,
        rest: RestClient,
        identify_limiter: Arc<dyn IdentifyRateLimiter>,
        sink: Arc<dyn EventSink>,
        registry: Arc<EventRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config: Arc::new(config),
                rest,
                identify_limiter,
                sink,
                registry,
                open_lock: tokio::sync::Mutex::new(()),
                state: Mutex::new(ManagerState::default()),
                conn_counter: AtomicU64::new(0),
            }),
        }
    }

    pub(super) fn from_inner(inner: Arc<ManagerInner>) -> Self {
        Self { inner }
    }

    #[must_use]
    pub fn shard_id(&self) -> u32 {
        self.inner.config.shard_id
    }

    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    /// Open a new connection, closing the current one first
    ///
    /// Resumes when a session is stored, identifies otherwise. Fails straight
    /// away once a fatal close code has been latched.
    pub fn open(&self) -> BoxFuture<'static, Result<(), GatewayError>> {
        let inner = Arc::clone(&self.inner);
        async move { inner.open().await }.boxed()
    }

    /// Close the current connection, keeping the session for a later resume
    #[instrument(skip(self), fields(shard_id = self.shard_id()))]
    pub async fn close(&self) {
        let current = self.inner.state.lock().current.take();
        match current {
            Some(conn) => conn.close().await,
            None => info!("No open gateway connection to close"),
        }
    }

    /// Replace the current connection
    ///
    /// With `force_identify` the stored session is dropped first, so the next
    /// open identifies even if no connection is up right now.
    pub async fn reconnect(&self, force_identify: bool) -> Result<(), GatewayError> {
        let current = {
            let mut state = self.inner.state.lock();
            if force_identify {
                state.session.session_id = None;
            }
            state.current.clone()
        };

        match current {
            Some(conn) => conn.reconnect(force_identify).await,
            None => {
                warn!(shard_id = self.shard_id(), "Reconnect requested without a connection");
                Ok(())
            }
        }
    }

    #[must_use]
    pub fn status(&self) -> GatewayStatus {
        self.current_connection()
            .map_or(GatewayStatus::Disconnected, |conn| conn.status())
    }

    /// `(last_send, last_ack)` of the current connection's heartbeater
    #[must_use]
    pub fn heartbeat_stats(&self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        self.current_connection()
            .map_or((None, None), |conn| conn.heartbeat_times())
    }

    #[must_use]
    pub fn session_info(&self) -> SessionInfo {
        self.inner.state.lock().session.clone()
    }

    /// Seed the session, e.g. to resume one saved by an earlier process
    pub fn set_session_info(&self, session_id: Option<String>, sequence: u64, resume_url: Option<String>) {
        self.inner.store_session(session_id, sequence, resume_url);
    }

    #[must_use]
    pub fn fatal_error(&self) -> Option<FatalError> {
        self.inner.state.lock().fatal
    }

    #[must_use]
    pub fn current_connection(&self) -> Option<Arc<GatewayConnection>> {
        self.inner.state.lock().current.clone()
    }

    fn require_connection(&self) -> Result<Arc<GatewayConnection>, GatewayError> {
        self.current_connection().ok_or(GatewayError::NotConnected)
    }

    pub async fn update_status(&self, data: UpdateStatusData) -> Result<(), GatewayError> {
        self.require_connection()?.update_status(&data).await
    }

    pub async fn update_playing_status(&self, text: &str, status: &str) -> Result<(), GatewayError> {
        self.update_status(UpdateStatusData::playing(text, status)).await
    }

    pub async fn update_streaming_status(&self, text: &str, status: &str, url: &str) -> Result<(), GatewayError> {
        self.update_status(UpdateStatusData::streaming(text, status, url)).await
    }

    pub async fn update_listening_status(&self, text: &str, status: &str) -> Result<(), GatewayError> {
        self.update_status(UpdateStatusData::listening(text, status)).await
    }

    pub async fn update_watching_status(&self, text: &str, status: &str) -> Result<(), GatewayError> {
        self.update_status(UpdateStatusData::watching(text, status)).await
    }

    pub async fn update_custom_status(&self, text: &str, status: &str) -> Result<(), GatewayError> {
        self.update_status(UpdateStatusData::custom(text, status)).await
    }

    pub async fn update_competing_status(&self, text: &str, status: &str) -> Result<(), GatewayError> {
        self.update_status(UpdateStatusData::competing(text, status)).await
    }

    /// Members whose name starts with `query`; an empty query with limit 0 asks for everyone
    pub async fn request_guild_members(&self, guild_id: Snowflake, query: &str, limit: u32) -> Result<(), GatewayError> {
        self.request_guild_members_complex(RequestGuildMembersData::new(guild_id, limit).with_query(query))
            .await
    }

    pub async fn request_guild_member_by_id(
        &self,
        guild_id: Snowflake,
        user_id: Snowflake,
        limit: u32,
    ) -> Result<(), GatewayError> {
        self.request_guild_members_complex(RequestGuildMembersData::new(guild_id, limit).with_user_ids(vec![user_id]))
            .await
    }

    pub async fn request_guild_members_complex(&self, data: RequestGuildMembersData) -> Result<(), GatewayError> {
        self.require_connection()?.request_guild_members(&data).await
    }

    /// Register `voice` for the guild and ask to join the channel
    ///
    /// An already registered connection for the guild is kept and returned
    /// instead of `voice`.
    pub async fn channel_voice_join(
        &self,
        guild_id: Snowflake,
        channel_id: Snowflake,
        self_mute: bool,
        self_deaf: bool,
        voice: Arc<dyn VoiceConnection>,
    ) -> Result<Arc<dyn VoiceConnection>, GatewayError> {
        let (conn, voice) = {
            let mut state = self.inner.state.lock();
            let conn = state.current.clone().ok_or(GatewayError::NotConnected)?;
            let voice = Arc::clone(state.voice.entry(guild_id).or_insert(voice));
            voice.rebind(Arc::downgrade(&conn));
            (conn, voice)
        };

        conn.voice_state_update(&VoiceStateUpdatePayload {
            guild_id,
            channel_id: Some(channel_id),
            self_mute,
            self_deaf,
        })
        .await?;
        Ok(voice)
    }

    /// Leave the guild's voice channel and forget its voice connection
    pub async fn channel_voice_leave(&self, guild_id: Snowflake) -> Result<(), GatewayError> {
        let conn = {
            let mut state = self.inner.state.lock();
            state.voice.remove(&guild_id);
            state.current.clone()
        };

        conn.ok_or(GatewayError::NotConnected)?
            .voice_state_update(&VoiceStateUpdatePayload {
                guild_id,
                channel_id: None,
                self_mute: true,
                self_deaf: true,
            })
            .await
    }

    #[must_use]
    pub fn voice_connection(&self, guild_id: Snowflake) -> Option<Arc<dyn VoiceConnection>> {
        self.inner.state.lock().voice.get(&guild_id).cloned()
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("shard_id", &self.shard_id())
            .field("status", &self.status())
            .field("fatal", &self.fatal_error())
            .finish_non_exhaustive()
    }
}
