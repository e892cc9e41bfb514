//! A single gateway connection
//!
//! Owns the socket tasks for one connect attempt: the reader, the paced writer
//! and the heartbeater, all tied to one stop signal. Closing is one-way; the
//! manager opens a fresh connection for every reconnect.

use super::heartbeat::Heartbeater;
use super::identify::IdentifyRateLimiter;
use super::manager::{ConnectionManager, GatewayConfig, ManagerInner, SessionInfo};
use super::reader;
use super::writer::{self, WriterHandle, WriterInbox};
use crate::error::GatewayError;
use crate::events::{EventRegistry, EventSink, GatewayEvent, ShardEvent};
use crate::protocol::{
    IdentifyPayload, OutgoingMessage, RequestGuildMembersData, ResumePayload, UpdateStatusData,
    VoiceStateUpdatePayload,
};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Delay between failed dial attempts
const CONNECT_RETRY: Duration = Duration::from_secs(5);
/// How long close waits for the server to hang up
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
const CLIENT_CLOSE_CODE: u16 = 4000;
const CLIENT_CLOSE_REASON: &str = "o7";

/// Where a connection is in its handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GatewayStatus {
    #[default]
    Disconnected,
    Connecting,
    Identifying,
    Resuming,
    Ready,
}

impl GatewayStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Identifying => "identifying",
            Self::Resuming => "resuming",
            Self::Ready => "ready",
        }
    }
}

impl fmt::Display for GatewayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
struct ConnState {
    status: GatewayStatus,
    session_id: Option<String>,
    resume_url: Option<String>,
    opened: bool,
    workers_running: bool,
    reconnecting: bool,
    inbox: Option<WriterInbox>,
    reader: Option<JoinHandle<()>>,
}

pub struct GatewayConnection {
    conn_id: u64,
    shard_id: u32,
    shard_count: u32,
    config: Arc<GatewayConfig>,
    identify_limiter: Arc<dyn IdentifyRateLimiter>,
    sink: Arc<dyn EventSink>,
    pub(super) registry: Arc<EventRegistry>,
    pub(super) manager: Weak<ManagerInner>,
    state: Mutex<ConnState>,
    /// Fired once by close; every task of this connection watches it
    pub(super) stop: CancellationToken,
    /// Forces the reader off the socket when the server never hangs up
    hangup: CancellationToken,
    pub(super) sequence: Arc<AtomicU64>,
    writer: WriterHandle,
    pub(super) heartbeater: Arc<Heartbeater>,
    span: Span,
}

impl GatewayConnection {
    pub(super) fn new(conn_id: u64, shard_count: u32, manager: &Arc<ManagerInner>) -> Arc<Self> {
        let shard_id = manager.config.shard_id;
        let stop = CancellationToken::new();
        let sequence = Arc::new(AtomicU64::new(0));
        let (writer, inbox) = writer::channel(stop.clone());
        let heartbeater = Arc::new(Heartbeater::new(
            Arc::clone(&sequence),
            writer.clone(),
            stop.clone(),
            manager.config.max_missed_acks,
        ));

        Arc::new(Self {
            conn_id,
            shard_id,
            shard_count,
            config: Arc::clone(&manager.config),
            identify_limiter: Arc::clone(&manager.identify_limiter),
            sink: Arc::clone(&manager.sink),
            registry: Arc::clone(&manager.registry),
            manager: Arc::downgrade(manager),
            state: Mutex::new(ConnState {
                inbox: Some(inbox),
                ..ConnState::default()
            }),
            stop,
            hangup: CancellationToken::new(),
            sequence,
            writer,
            heartbeater,
            span: info_span!("gateway", shard_id, conn_id),
        })
    }

    #[must_use]
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    #[must_use]
    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    #[must_use]
    pub fn status(&self) -> GatewayStatus {
        self.state.lock().status
    }

    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.state.lock().session_id.clone()
    }

    /// Last received sequence number
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    /// `(last_send, last_ack)` of the heartbeater
    #[must_use]
    pub fn heartbeat_times(&self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        self.heartbeater.times()
    }

    /// True once close has started
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub(super) fn span(&self) -> &Span {
        &self.span
    }

    pub(super) fn set_status(&self, status: GatewayStatus) {
        self.state.lock().status = status;
    }

    /// Dial, start the workers and send Identify or Resume
    ///
    /// Resumes when `session` carries a session id, against its resume URL when
    /// one is known.
    pub(super) async fn open(self: &Arc<Self>, gateway_url: &str, session: SessionInfo) -> Result<(), GatewayError> {
        self.open_inner(gateway_url, session).instrument(self.span.clone()).await
    }

    async fn open_inner(self: &Arc<Self>, gateway_url: &str, session: SessionInfo) -> Result<(), GatewayError> {
        let inbox = {
            let mut state = self.state.lock();
            if state.opened {
                return Err(GatewayError::AlreadyOpen);
            }
            state.opened = true;
            state.status = GatewayStatus::Connecting;
            state.session_id.clone_from(&session.session_id);
            state.resume_url.clone_from(&session.resume_url);
            state.inbox.take().ok_or(GatewayError::AlreadyOpen)?
        };

        let base = match (&session.session_id, &session.resume_url) {
            (Some(_), Some(resume_url)) => resume_url.as_str(),
            _ => gateway_url,
        };
        let url = connect_url(base, self.config.api_version, self.config.compress);

        let ws = self.connect(&url).await?;
        info!(%url, "Connected to the gateway");

        let (sink, stream) = ws.split();
        tokio::spawn(writer::run(inbox, sink, self.stop.clone()).instrument(self.span.clone()));
        let reader = tokio::spawn(
            reader::run(Arc::clone(self), stream, self.hangup.clone(), self.config.compress)
                .instrument(self.span.clone()),
        );

        {
            let mut state = self.state.lock();
            state.workers_running = true;
            state.reader = Some(reader);
        }

        // Closed while dialing; close has already persisted the session
        if self.stop.is_cancelled() {
            self.hangup.cancel();
            return Err(GatewayError::Closed);
        }

        self.emit(GatewayEvent::Connected).await;

        match session.session_id {
            Some(session_id) => self.resume(session_id, session.sequence).await,
            None => self.identify().await,
        }
    }

    async fn connect(&self, url: &str) -> Result<WsStream, GatewayError> {
        loop {
            let attempt = tokio::select! {
                biased;
                () = self.stop.cancelled() => return Err(GatewayError::Closed),
                res = connect_async(url) => res,
            };

            match attempt {
                Ok((ws, _)) => return Ok(ws),
                Err(e) => error!(
                    error = %e,
                    retry_secs = CONNECT_RETRY.as_secs(),
                    "Failed opening connection to the gateway, retrying"
                ),
            }

            tokio::select! {
                biased;
                () = self.stop.cancelled() => return Err(GatewayError::Closed),
                () = sleep(CONNECT_RETRY) => {}
            }
        }
    }

    async fn identify(&self) -> Result<(), GatewayError> {
        let payload = IdentifyPayload::new(self.config.token.clone(), self.config.intents, self.config.large_threshold)
            .with_shard(self.shard_id, self.shard_count);
        let msg = OutgoingMessage::identify(&payload)?;

        tokio::select! {
            biased;
            () = self.stop.cancelled() => return Err(GatewayError::Closed),
            () = self.identify_limiter.wait(self.shard_id) => {}
        }
        info!("Sending identify");
        self.set_status(GatewayStatus::Identifying);
        self.writer.queue(msg).await
    }

    async fn resume(&self, session_id: String, sequence: u64) -> Result<(), GatewayError> {
        self.sequence.store(sequence, Ordering::Release);
        let msg = OutgoingMessage::resume(&ResumePayload {
            token: self.config.token.clone(),
            session_id,
            seq: sequence,
        })?;

        info!(seq = sequence, "Sending resume");
        self.set_status(GatewayStatus::Resuming);
        self.writer.queue(msg).await
    }

    /// Close this connection and open a new one through the manager
    ///
    /// Only the first call on a connection does anything. With
    /// `force_identify` the session is dropped so the new connection
    /// identifies instead of resuming.
    pub async fn reconnect(&self, force_identify: bool) -> Result<(), GatewayError> {
        async {
            {
                let mut state = self.state.lock();
                if state.reconnecting {
                    debug!("Reconnect already in progress");
                    return Ok(());
                }
                state.reconnecting = true;
                if force_identify {
                    state.session_id = None;
                }
            }

            info!(force_identify, "Reconnecting to the gateway");
            self.close().await;

            let inner = self.manager.upgrade().ok_or(GatewayError::ManagerGone)?;
            ConnectionManager::from_inner(inner).open().await
        }
        .instrument(self.span.clone())
        .await
    }

    /// Like [`Self::reconnect`], but does nothing once close has started
    pub async fn reconnect_unless_closed(&self, force_identify: bool) -> Result<(), GatewayError> {
        if self.stop.is_cancelled() {
            debug!(parent: &self.span, "Connection already closed, not reconnecting");
            return Ok(());
        }
        self.reconnect(force_identify).await
    }

    /// Reconnect on a background task, logging failures
    pub(super) fn spawn_reconnect(self: &Arc<Self>, force_identify: bool) {
        let conn = Arc::clone(self);
        tokio::spawn(
            async move {
                if let Err(e) = conn.reconnect_unless_closed(force_identify).await {
                    error!(error = %e, "Failed reconnecting to the gateway");
                }
            }
            .instrument(self.span.clone()),
        );
    }

    pub(super) fn spawn_close(self: &Arc<Self>) {
        let conn = Arc::clone(self);
        tokio::spawn(async move { conn.close().await }.instrument(self.span.clone()));
    }

    /// Send a normal close, stop every task and hand the session back to the manager
    ///
    /// Waits briefly for the server to hang up before dropping the socket.
    /// Safe to call more than once.
    pub async fn close(&self) {
        self.close_inner().instrument(self.span.clone()).await;
    }

    async fn close_inner(&self) {
        let (was_running, reader) = {
            let mut state = self.state.lock();
            state.status = GatewayStatus::Disconnected;
            (std::mem::take(&mut state.workers_running), state.reader.take())
        };

        if was_running {
            info!("Closing gateway connection");
            let frame = CloseFrame {
                code: WsCloseCode::from(CLIENT_CLOSE_CODE),
                reason: CLIENT_CLOSE_REASON.into(),
            };
            if let Err(e) = self.writer.queue_close(frame).await {
                debug!(error = %e, "Close frame not queued");
            }
        }
        self.stop.cancel();

        if let Some(mut reader) = reader {
            if timeout(CLOSE_TIMEOUT, &mut reader).await.is_err() {
                warn!("Gateway did not hang up in time, dropping the socket");
                self.hangup.cancel();
                // The reader may be parked on a full event sink and never see the hangup
                reader.abort();
                let _ = reader.await;
            }
        }

        self.persist_session();
    }

    fn persist_session(&self) {
        let (session_id, resume_url) = {
            let state = self.state.lock();
            (state.session_id.clone(), state.resume_url.clone())
        };
        let sequence = self.sequence.load(Ordering::Acquire);

        if let Some(manager) = self.manager.upgrade() {
            manager.store_session(session_id, sequence, resume_url);
        }
    }

    /// Record a new session from READY and release held messages
    pub(super) fn session_ready(&self, session_id: String, resume_url: Option<String>) {
        let resume_url = resume_url.map(with_trailing_slash);
        {
            let mut state = self.state.lock();
            state.status = GatewayStatus::Ready;
            state.session_id = Some(session_id.clone());
            state.resume_url.clone_from(&resume_url);
        }
        self.writer.signal_ready();

        if let Some(manager) = self.manager.upgrade() {
            manager.store_session(Some(session_id), self.sequence(), resume_url);
        }
    }

    pub(super) fn session_resumed(&self) {
        self.set_status(GatewayStatus::Ready);
        self.writer.signal_ready();
    }

    pub(super) async fn emit(&self, event: GatewayEvent) {
        self.sink
            .deliver(ShardEvent {
                shard_id: self.shard_id,
                event,
            })
            .await;
    }

    pub(super) async fn send_beat(&self) {
        self.heartbeater.send_beat().await;
    }

    pub async fn update_status(&self, data: &UpdateStatusData) -> Result<(), GatewayError> {
        self.writer.queue(OutgoingMessage::status_update(data)?).await
    }

    pub async fn request_guild_members(&self, data: &RequestGuildMembersData) -> Result<(), GatewayError> {
        self.writer.queue(OutgoingMessage::request_guild_members(data)?).await
    }

    pub async fn voice_state_update(&self, data: &VoiceStateUpdatePayload) -> Result<(), GatewayError> {
        self.writer.queue(OutgoingMessage::voice_state_update(data)?).await
    }
}

impl fmt::Debug for GatewayConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConnection")
            .field("conn_id", &self.conn_id)
            .field("shard_id", &self.shard_id)
            .field("status", &self.status())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Socket URL with the version, encoding and compression parameters
fn connect_url(base: &str, api_version: u8, compress: bool) -> String {
    let base = base.trim_end_matches('/');
    let mut url = format!("{base}/?v={api_version}&encoding=json");
    if compress {
        url.push_str("&compress=zlib-stream");
    }
    url
}

fn with_trailing_slash(mut url: String) -> String {
    if !url.ends_with('/') {
        url.push('/');
    }
    url
}
