//! Reader task
//!
//! Reads frames until the socket ends or close forces a hangup, reassembles
//! compressed messages and routes each envelope by opcode. Anything that needs
//! a reconnect runs on its own task so the reader keeps draining.

use super::connection::{GatewayConnection, WsStream};
use super::frames::FrameAssembler;
use crate::events::{DispatchEvent, GatewayEvent};
use crate::protocol::{classify, CloseCode, GatewayPayload, HelloPayload, OpCode};
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use rand::Rng;
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn, Instrument};

pub(super) async fn run(
    conn: Arc<GatewayConnection>,
    mut stream: SplitStream<WsStream>,
    hangup: CancellationToken,
    compressed: bool,
) {
    let mut frames = FrameAssembler::new(compressed);
    // Set once the server's close frame has been acted on
    let mut server_closed = false;

    loop {
        let next = tokio::select! {
            biased;
            () = hangup.cancelled() => break,
            next = stream.next() => next,
        };

        let msg = match next {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                if !conn.is_closed() && !server_closed {
                    error!(error = %e, "Error reading from the gateway");
                    conn.spawn_reconnect(false);
                }
                break;
            }
            None => {
                if !conn.is_closed() && !server_closed {
                    warn!("Gateway connection ended unexpectedly");
                    conn.spawn_reconnect(false);
                }
                break;
            }
        };

        // Closing: drain until the server hangs up, handle nothing
        if conn.is_closed() {
            continue;
        }

        let bytes = match &msg {
            Message::Binary(data) => match frames.push_binary(data) {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(e) => {
                    error!(error = %e, "Failed to inflate gateway message");
                    conn.spawn_reconnect(false);
                    continue;
                }
            },
            Message::Text(text) => frames.push_text(text),
            Message::Close(frame) => {
                server_closed = true;
                handle_close(&conn, frame.as_ref());
                continue;
            }
            _ => continue,
        };

        let payload = match serde_json::from_slice::<GatewayPayload>(bytes) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Failed to decode gateway message");
                conn.spawn_reconnect(false);
                continue;
            }
        };

        handle_payload(&conn, payload).await;
    }

    conn.emit(GatewayEvent::Disconnected).await;
    debug!("Reader stopped");
}

fn handle_close(conn: &Arc<GatewayConnection>, frame: Option<&CloseFrame<'_>>) {
    let code = frame.map(|f| u16::from(f.code));
    let reason = frame.map_or("", |f| f.reason.as_ref());

    match code.and_then(classify) {
        Some(fatal) => {
            error!(code = ?code, reason, error = %fatal, "Gateway ended the session, not reconnecting");
            if let Some(manager) = conn.manager.upgrade() {
                manager.latch_fatal(fatal);
            }
            conn.spawn_close();
        }
        None => {
            let description = code
                .and_then(CloseCode::from_u16)
                .map_or("unknown", CloseCode::description);
            warn!(code = ?code, reason, description, "Gateway closed the connection, reconnecting");
            conn.spawn_reconnect(false);
        }
    }
}

async fn handle_payload(conn: &Arc<GatewayConnection>, mut payload: GatewayPayload) {
    if let Some(seq) = payload.s {
        conn.sequence.store(seq, Ordering::Release);
    }

    let Some(op) = payload.opcode() else {
        warn!(op = payload.op, "Unknown gateway opcode");
        return;
    };
    trace!(%payload, "Gateway payload");

    match op {
        OpCode::Dispatch => handle_dispatch(conn, payload).await,
        OpCode::Heartbeat => {
            debug!("Gateway requested a heartbeat");
            let beat = Arc::clone(conn);
            tokio::spawn(async move { beat.send_beat().await }.instrument(conn.span().clone()));
        }
        OpCode::Reconnect => {
            info!("Gateway requested a reconnect");
            conn.spawn_reconnect(false);
        }
        OpCode::InvalidSession => {
            let resumable = payload.d.as_ref().and_then(Value::as_bool).unwrap_or(false);
            let delay = Duration::from_secs(rand::thread_rng().gen_range(1..=4));
            warn!(resumable, delay_secs = delay.as_secs(), "Session invalidated");

            let target = Arc::clone(conn);
            tokio::spawn(
                async move {
                    sleep(delay).await;
                    if let Err(e) = target.reconnect_unless_closed(!resumable).await {
                        error!(error = %e, "Failed reconnecting after an invalid session");
                    }
                }
                .instrument(conn.span().clone()),
            );
        }
        OpCode::Hello => handle_hello(conn, payload.take_data()),
        OpCode::HeartbeatAck => conn.heartbeater.received_ack(),
        other => warn!(op = %other, "Gateway sent a client-only opcode"),
    }
}

async fn handle_dispatch(conn: &Arc<GatewayConnection>, mut payload: GatewayPayload) {
    let Some(name) = payload.t.take() else {
        warn!("Dispatch without an event name");
        return;
    };

    let event = match conn.registry.decode(&name, payload.take_data()) {
        Some(Ok(event)) => event,
        Some(Err(e)) => {
            error!(event = %name, error = %e, "Failed to decode dispatch");
            return;
        }
        None => {
            warn!(event = %name, "Unknown dispatch event");
            return;
        }
    };

    match &event {
        DispatchEvent::Ready(ready) => {
            info!(session_id = %ready.session_id, guilds = ready.guilds.len(), "Session ready");
            conn.session_ready(ready.session_id.clone(), ready.resume_gateway_url.clone());
        }
        DispatchEvent::Resumed(_) => {
            info!("Session resumed");
            conn.session_resumed();
        }
        _ => {}
    }

    conn.emit(GatewayEvent::Dispatch(event)).await;
}

fn handle_hello(conn: &Arc<GatewayConnection>, data: Value) {
    let hello: HelloPayload = match serde_json::from_value(data) {
        Ok(hello) => hello,
        Err(e) => {
            error!(error = %e, "Malformed hello");
            return;
        }
    };
    info!(heartbeat_interval_ms = hello.heartbeat_interval, "Received hello");

    let weak = Arc::downgrade(conn);
    conn.heartbeater
        .start(Duration::from_millis(hello.heartbeat_interval), move || {
            if let Some(conn) = weak.upgrade() {
                conn.spawn_reconnect(false);
            }
        });
}
