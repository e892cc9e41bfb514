//! Gateway wire protocol
//!
//! Op codes, close codes, intents and the JSON payloads exchanged with the gateway.

mod close_codes;
mod intents;
mod messages;
mod opcodes;
mod payloads;
mod snowflake;

pub use close_codes::{classify, CloseCode};
pub use intents::Intents;
pub use messages::{GatewayPayload, OutgoingMessage};
pub use opcodes::OpCode;
pub use payloads::{
    Activity, ActivityType, HelloPayload, IdentifyPayload, IdentifyProperties, RequestGuildMembersData,
    ResumePayload, UpdateStatusData, VoiceStateUpdatePayload,
};
pub use snowflake::Snowflake;
