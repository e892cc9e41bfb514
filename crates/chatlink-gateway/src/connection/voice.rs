//! Voice sub-connections
//!
//! The voice subsystem lives outside this crate. The manager only keeps its
//! connections by guild and points them at the newest gateway connection.

use super::GatewayConnection;
use crate::protocol::Snowflake;
use std::fmt;
use std::sync::Weak;

pub trait VoiceConnection: Send + Sync + fmt::Debug + 'static {
    fn guild_id(&self) -> Snowflake;

    /// Called after every successful open, and once when registered
    fn rebind(&self, gateway: Weak<GatewayConnection>);
}
