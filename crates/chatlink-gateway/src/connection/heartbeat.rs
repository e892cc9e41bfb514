//! Heartbeater
//!
//! Beats on the interval from Hello. A tick that finds the previous beat
//! unacknowledged counts as a miss; enough misses hand control to the no-ack
//! callback and end the loop.

use super::writer::WriterHandle;
use crate::protocol::OutgoingMessage;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug)]
struct BeatState {
    received_ack: bool,
    missed: u32,
    last_send: Option<DateTime<Utc>>,
    last_ack: Option<DateTime<Utc>>,
    task: Option<JoinHandle<()>>,
}

#[derive(Debug)]
pub(crate) struct Heartbeater {
    state: Mutex<BeatState>,
    sequence: Arc<AtomicU64>,
    writer: WriterHandle,
    stop: CancellationToken,
    max_missed_acks: u32,
}

impl Heartbeater {
    pub(crate) fn new(
        sequence: Arc<AtomicU64>,
        writer: WriterHandle,
        stop: CancellationToken,
        max_missed_acks: u32,
    ) -> Self {
        Self {
            state: Mutex::new(BeatState {
                received_ack: true,
                missed: 0,
                last_send: None,
                last_ack: None,
                task: None,
            }),
            sequence,
            writer,
            stop,
            max_missed_acks: max_missed_acks.max(1),
        }
    }

    /// Arm the beat loop; later calls are ignored
    pub(crate) fn start<F>(self: &Arc<Self>, interval: Duration, on_no_ack: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state.lock();
        if state.task.is_some() {
            debug!("Heartbeater already running");
            return;
        }

        let this = Arc::clone(self);
        state.task = Some(tokio::spawn(async move { this.run(interval, on_no_ack).await }));
    }

    async fn run<F>(&self, interval: Duration, on_no_ack: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = self.stop.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let missed = {
                let mut state = self.state.lock();
                if std::mem::replace(&mut state.received_ack, false) {
                    state.missed = 0;
                } else {
                    state.missed += 1;
                }
                state.missed
            };

            if missed >= self.max_missed_acks {
                warn!(missed, "No heartbeat ack received");
                on_no_ack();
                return;
            }
            if missed > 0 {
                warn!(missed, max = self.max_missed_acks, "Heartbeat ack missed, beating again");
            }

            self.send_beat().await;
        }
    }

    /// Queue a beat carrying the last seen sequence
    pub(crate) async fn send_beat(&self) {
        self.state.lock().last_send = Some(Utc::now());

        let seq = self.sequence.load(Ordering::Acquire);
        if let Err(e) = self.writer.queue(OutgoingMessage::heartbeat(seq)).await {
            debug!(error = %e, "Heartbeat not queued");
        }
    }

    pub(crate) fn received_ack(&self) {
        let mut state = self.state.lock();
        state.received_ack = true;
        state.missed = 0;
        state.last_ack = Some(Utc::now());
    }

    /// Last send and last ack
    pub(crate) fn times(&self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        let state = self.state.lock();
        (state.last_send, state.last_ack)
    }
}
