//! A single route's rate limit state

use crate::error::RateLimitError;
use parking_lot::Mutex;
use reqwest::header::HeaderMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{Duration, Instant};
use tracing::trace;

const HEADER_REMAINING: &str = "x-ratelimit-remaining";
const HEADER_RESET_AFTER: &str = "x-ratelimit-reset-after";
const HEADER_RETRY_AFTER: &str = "retry-after";
const HEADER_GLOBAL: &str = "x-ratelimit-global";

/// Fixed quota applied to every bucket whose key ends with `suffix`
///
/// Buckets with a custom policy ignore response headers entirely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomRateLimit {
    pub suffix: String,
    pub requests: i64,
    pub reset: Duration,
}

/// Token returned by a successful lock, required to release it
///
/// A release carrying a stale epoch is ignored, so releasing twice is harmless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockEpoch(u64);

/// "Locked until" timestamp shared by every bucket of one limiter
#[derive(Debug, Default)]
pub(super) struct GlobalLock {
    until: Mutex<Option<Instant>>,
}

impl GlobalLock {
    pub(super) fn until(&self) -> Option<Instant> {
        *self.until.lock()
    }

    pub(super) fn set(&self, until: Instant) {
        *self.until.lock() = Some(until);
    }
}

#[derive(Debug)]
pub(super) struct BucketState {
    pub(super) remaining: i64,
    pub(super) reset: Option<Instant>,
    last_reset: Option<Instant>,
    epoch: u64,
    held: Option<OwnedSemaphorePermit>,
    counted: bool,
}

/// Rate limit tracking for one route
#[derive(Debug)]
pub struct Bucket {
    key: String,
    pub(super) gate: Arc<Semaphore>,
    pub(super) state: Mutex<BucketState>,
    global: Arc<GlobalLock>,
    in_flight: Arc<AtomicUsize>,
    custom: Option<CustomRateLimit>,
}

impl Bucket {
    pub(super) fn new(
        key: String,
        global: Arc<GlobalLock>,
        in_flight: Arc<AtomicUsize>,
        custom: Option<CustomRateLimit>,
    ) -> Self {
        Self {
            key,
            gate: Arc::new(Semaphore::new(1)),
            state: Mutex::new(BucketState {
                remaining: 1,
                reset: None,
                last_reset: None,
                epoch: 0,
                held: None,
                counted: false,
            }),
            global,
            in_flight,
            custom,
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn remaining(&self) -> i64 {
        self.state.lock().remaining
    }

    #[must_use]
    pub fn reset_at(&self) -> Option<Instant> {
        self.state.lock().reset
    }

    #[must_use]
    pub fn custom_rate_limit(&self) -> Option<&CustomRateLimit> {
        self.custom.as_ref()
    }

    /// Record a successful lock and hand out its epoch
    pub(super) fn enter(&self, permit: Option<OwnedSemaphorePermit>, counted: bool) -> LockEpoch {
        let mut state = self.state.lock();
        state.remaining -= 1;
        state.held = permit;
        state.counted = counted;
        LockEpoch(state.epoch)
    }

    /// Leave the critical section, updating state from the response headers
    ///
    /// Does nothing when `epoch` is not the current one. Otherwise the bucket is
    /// unlocked even if a header fails to parse.
    pub fn release(&self, headers: Option<&HeaderMap>, epoch: LockEpoch) -> Result<(), RateLimitError> {
        let mut state = self.state.lock();
        if state.epoch != epoch.0 {
            trace!(bucket = %self.key, "ignoring stale release");
            return Ok(());
        }

        state.epoch = state.epoch.wrapping_add(1);
        let permit = state.held.take();
        if std::mem::take(&mut state.counted) {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
        }

        let result = self.apply_update(&mut state, headers, Instant::now());

        drop(state);
        drop(permit);
        result
    }

    fn apply_update(
        &self,
        state: &mut BucketState,
        headers: Option<&HeaderMap>,
        now: Instant,
    ) -> Result<(), RateLimitError> {
        if let Some(rl) = &self.custom {
            let elapsed = state.last_reset.map(|at| now.duration_since(at));
            if elapsed.map_or(true, |e| e >= rl.reset) {
                state.remaining = rl.requests - 1;
                state.last_reset = Some(now);
            }
            if state.remaining < 1 {
                state.reset = Some(now + rl.reset);
            }
            return Ok(());
        }

        let Some(headers) = headers else {
            return Ok(());
        };

        if let Some(retry_after) = header_str(headers, HEADER_RETRY_AFTER)? {
            let reset_at = now + parse_seconds(HEADER_RETRY_AFTER, retry_after)?;
            if headers.contains_key(HEADER_GLOBAL) {
                self.global.set(reset_at);
            } else {
                state.reset = Some(reset_at);
            }
        } else if let Some(reset_after) = header_str(headers, HEADER_RESET_AFTER)? {
            state.reset = Some(now + parse_seconds(HEADER_RESET_AFTER, reset_after)?);
        }

        if let Some(remaining) = header_str(headers, HEADER_REMAINING)? {
            state.remaining = remaining.trim().parse().map_err(|_| RateLimitError::InvalidHeader {
                name: HEADER_REMAINING,
                value: remaining.to_string(),
            })?;
        }

        Ok(())
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<Option<&'a str>, RateLimitError> {
    match headers.get(name) {
        None => Ok(None),
        Some(value) => value.to_str().map(Some).map_err(|_| RateLimitError::InvalidHeader {
            name,
            value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
        }),
    }
}

/// Parse a float number of seconds such as `"1.25"`
fn parse_seconds(name: &'static str, raw: &str) -> Result<Duration, RateLimitError> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .ok_or_else(|| RateLimitError::InvalidHeader {
            name,
            value: raw.to_string(),
        })
}
