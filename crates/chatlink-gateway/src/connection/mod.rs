//! Connection lifecycle
//!
//! [`ConnectionManager`] is the long-lived handle for one shard. Every open
//! builds a new [`GatewayConnection`]; a connection is never reopened after it
//! closes.

mod connection;
mod frames;
mod heartbeat;
mod identify;
mod manager;
mod reader;
mod voice;
mod writer;

pub use connection::{GatewayConnection, GatewayStatus};
pub use identify::{IdentifyRateLimiter, StdIdentifyRateLimiter, DEFAULT_IDENTIFY_INTERVAL};
pub use manager::{ConnectionManager, GatewayConfig, SessionInfo};
pub use voice::VoiceConnection;
