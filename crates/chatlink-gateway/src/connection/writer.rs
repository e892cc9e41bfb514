//! Outbound writer
//!
//! Every frame leaves through one task, so writes never interleave. Sends are
//! paced to one per [`SEND_INTERVAL`]; close frames skip the pacing.

use crate::error::GatewayError;
use crate::protocol::{OpCode, OutgoingMessage};
use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio::time::{self, sleep, Duration, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

pub(crate) const SEND_INTERVAL: Duration = Duration::from_millis(500);
/// How long queueing may block before the message is abandoned
pub(crate) const QUEUE_TIMEOUT: Duration = Duration::from_secs(10);
const QUEUE_CAPACITY: usize = 10;

/// Producer side, owned by the connection
#[derive(Debug, Clone)]
pub(crate) struct WriterHandle {
    incoming: mpsc::Sender<OutgoingMessage>,
    close: mpsc::Sender<CloseFrame<'static>>,
    ready: mpsc::Sender<()>,
    stop: CancellationToken,
}

/// Consumer side, moved into the writer task
#[derive(Debug)]
pub(crate) struct WriterInbox {
    incoming: mpsc::Receiver<OutgoingMessage>,
    close: mpsc::Receiver<CloseFrame<'static>>,
    ready: mpsc::Receiver<()>,
}

pub(crate) fn channel(stop: CancellationToken) -> (WriterHandle, WriterInbox) {
    let (incoming_tx, incoming_rx) = mpsc::channel(QUEUE_CAPACITY);
    let (close_tx, close_rx) = mpsc::channel(1);
    let (ready_tx, ready_rx) = mpsc::channel(1);

    (
        WriterHandle {
            incoming: incoming_tx,
            close: close_tx,
            ready: ready_tx,
            stop,
        },
        WriterInbox {
            incoming: incoming_rx,
            close: close_rx,
            ready: ready_rx,
        },
    )
}

impl WriterHandle {
    /// Queue a message behind everything already queued
    pub(crate) async fn queue(&self, msg: OutgoingMessage) -> Result<(), GatewayError> {
        tokio::select! {
            biased;
            () = self.stop.cancelled() => Err(GatewayError::Closed),
            sent = self.incoming.send(msg) => sent.map_err(|_| GatewayError::Closed),
            () = sleep(QUEUE_TIMEOUT) => Err(GatewayError::QueueTimeout),
        }
    }

    /// Hand a close frame to the writer; it is sent even if the stop signal fires right after
    pub(crate) async fn queue_close(&self, frame: CloseFrame<'static>) -> Result<(), GatewayError> {
        tokio::select! {
            biased;
            () = self.stop.cancelled() => Err(GatewayError::Closed),
            sent = self.close.send(frame) => sent.map_err(|_| GatewayError::Closed),
            () = sleep(QUEUE_TIMEOUT) => Err(GatewayError::QueueTimeout),
        }
    }

    /// Release messages held back since Identify
    pub(crate) fn signal_ready(&self) {
        // A full slot already carries the signal
        let _ = self.ready.try_send(());
    }
}

#[cfg(test)]
impl WriterInbox {
    pub(crate) async fn recv_incoming(&mut self) -> Option<OutgoingMessage> {
        self.incoming.recv().await
    }

    pub(crate) fn try_recv_incoming(&mut self) -> Option<OutgoingMessage> {
        self.incoming.try_recv().ok()
    }
}

/// Writer task body; returns when the stop signal fires or the socket fails
pub(crate) async fn run<S>(mut inbox: WriterInbox, mut sink: S, stop: CancellationToken)
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let mut pace = time::interval(SEND_INTERVAL);
    pace.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut held: Vec<OutgoingMessage> = Vec::new();
    let mut awaiting_ready = false;

    loop {
        tokio::select! {
            biased;

            () = stop.cancelled() => {
                if let Ok(frame) = inbox.close.try_recv() {
                    send_close(&mut sink, frame).await;
                }
                break;
            }

            Some(frame) = inbox.close.recv() => send_close(&mut sink, frame).await,

            Some(()) = inbox.ready.recv() => {
                awaiting_ready = false;
                if !held.is_empty() {
                    debug!(count = held.len(), "Flushing messages held until Ready");
                }
                for msg in std::mem::take(&mut held) {
                    if let Err(e) = write(&mut sink, &mut pace, &stop, &msg).await {
                        report(&e);
                        return;
                    }
                }
            }

            Some(msg) = inbox.incoming.recv() => {
                if awaiting_ready {
                    trace!(op = %msg.op, "Holding message until Ready");
                    held.push(msg);
                    continue;
                }
                if msg.op == OpCode::Identify {
                    awaiting_ready = true;
                }
                if let Err(e) = write(&mut sink, &mut pace, &stop, &msg).await {
                    report(&e);
                    return;
                }
            }
        }
    }
}

async fn write<S>(sink: &mut S, pace: &mut Interval, stop: &CancellationToken, msg: &OutgoingMessage) -> Result<(), GatewayError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    tokio::select! {
        biased;
        () = stop.cancelled() => return Err(GatewayError::Closed),
        _ = pace.tick() => {}
    }

    let json = msg.to_json()?;
    trace!(op = %msg.op, "Sending");
    sink.send(Message::Text(json)).await?;
    Ok(())
}

async fn send_close<S>(sink: &mut S, frame: CloseFrame<'static>)
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    debug!(code = u16::from(frame.code), reason = %frame.reason, "Sending close frame");
    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
        debug!(error = %e, "Failed to send close frame");
    }
}

fn report(err: &GatewayError) {
    match err {
        GatewayError::Closed => {}
        other => error!(error = %other, "Error writing to gateway"),
    }
}
