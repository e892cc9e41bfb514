//! Wire types for REST responses

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Body of a 429 response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TooManyRequests {
    #[serde(default)]
    pub message: String,
    /// Seconds, with millisecond precision
    pub retry_after: f64,
    #[serde(default)]
    pub global: bool,
}

impl TooManyRequests {
    /// How long to back off; malformed values count as zero
    #[must_use]
    pub fn retry_after_dur(&self) -> Duration {
        Duration::try_from_secs_f64(self.retry_after).unwrap_or(Duration::ZERO)
    }
}

/// Error body returned with most 4xx responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorMessage {
    pub code: i64,
    pub message: String,
}

/// Response of `GET /gateway`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayResponse {
    pub url: String,
}

/// Response of `GET /gateway/bot`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayBotResponse {
    pub url: String,
    pub shards: u32,
    #[serde(default)]
    pub session_start_limit: Option<SessionStartLimit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStartLimit {
    pub total: u32,
    pub remaining: u32,
    /// Milliseconds
    pub reset_after: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
}

fn default_max_concurrency() -> u32 {
    1
}
