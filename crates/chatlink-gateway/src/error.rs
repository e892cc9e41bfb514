//! Gateway error types

use chatlink_rest::RestError;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Session-terminal conditions latched by the manager
///
/// Each maps to one close code. Once latched, every later open returns the same value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum FatalError {
    #[error("authentication failed (close code 4004)")]
    BadAuth,
    #[error("invalid shard configuration (close code 4010)")]
    InvalidShard,
    #[error("invalid intent value (close code 4013)")]
    InvalidIntent,
    #[error("disallowed intent requested (close code 4014)")]
    DisabledIntent,
}

/// Gateway error type
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A fatal close code was received earlier; reconnecting is pointless
    #[error("gateway stopped: {0}")]
    Fatal(#[from] FatalError),

    #[error("shard id {id} is out of range for shard count {count}")]
    InvalidShard { id: u32, count: u32 },

    #[error("connection is already open")]
    AlreadyOpen,

    #[error("no open gateway connection")]
    NotConnected,

    #[error("failed to resolve gateway URL: {0}")]
    Rest(#[from] RestError),

    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("zlib stream error: {0}")]
    Inflate(#[from] flate2::DecompressError),

    /// The owning manager was dropped while the connection was still running
    #[error("connection manager is gone")]
    ManagerGone,

    #[error("connection is closed")]
    Closed,

    #[error("timed out waiting for the outbound queue")]
    QueueTimeout,
}

impl From<tungstenite::Error> for GatewayError {
    fn from(err: tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

impl GatewayError {
    /// The latched fatal condition, if this error is one
    #[must_use]
    pub fn fatal(&self) -> Option<FatalError> {
        match self {
            Self::Fatal(err) => Some(*err),
            _ => None,
        }
    }
}
