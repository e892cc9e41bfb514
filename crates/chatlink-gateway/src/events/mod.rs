//! Gateway events
//!
//! Dispatch names, typed payloads, the decoder registry and the sink that
//! receives decoded events.

mod event_types;
mod payloads;
mod registry;
mod sink;

pub use event_types::GatewayEventType;
pub use payloads::{
    GuildCreateEvent, GuildDeleteEvent, GuildMembersChunkEvent, MemberPayload, MessageCreateEvent, ReadyEvent,
    ResumedEvent, UnavailableGuild, UserPayload, VoiceServerUpdateEvent, VoiceStateEvent,
};
pub use registry::{DispatchEvent, EventRegistry};
pub use sink::{EventSink, GatewayEvent, NullSink, ShardEvent};
