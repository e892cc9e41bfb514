//! # chatlink-gateway
//!
//! Client for the chat platform's real-time gateway.
//!
//! A [`ConnectionManager`] owns one shard's lifecycle: it resolves the gateway
//! URL, opens a fresh [`GatewayConnection`] for every (re)connect, and keeps the
//! session id and sequence needed to resume. Each connection runs a reader, a
//! paced writer and a heartbeater that share one stop signal.

pub mod connection;
pub mod error;
pub mod events;
pub mod protocol;
pub mod shard;

pub use connection::{
    ConnectionManager, GatewayConfig, GatewayConnection, GatewayStatus, IdentifyRateLimiter,
    SessionInfo, StdIdentifyRateLimiter, VoiceConnection,
};
pub use error::{FatalError, GatewayError};
pub use events::{DispatchEvent, EventRegistry, EventSink, GatewayEvent, GatewayEventType, ShardEvent};
pub use protocol::{CloseCode, Intents, OpCode, Snowflake};
pub use shard::ShardSupervisor;
