//! Dispatch decoding
//!
//! Maps each known event name to a decoder. The registry is built once and
//! shared by every connection of a manager.

use super::payloads::{
    GuildCreateEvent, GuildDeleteEvent, GuildMembersChunkEvent, MessageCreateEvent, ReadyEvent, ResumedEvent,
    VoiceServerUpdateEvent, VoiceStateEvent,
};
use super::GatewayEventType;
use serde_json::Value;
use std::collections::HashMap;

/// A decoded dispatch
#[derive(Debug, Clone)]
pub enum DispatchEvent {
    Ready(Box<ReadyEvent>),
    Resumed(ResumedEvent),
    GuildCreate(Box<GuildCreateEvent>),
    GuildDelete(GuildDeleteEvent),
    MessageCreate(Box<MessageCreateEvent>),
    VoiceStateUpdate(Box<VoiceStateEvent>),
    VoiceServerUpdate(VoiceServerUpdateEvent),
    GuildMembersChunk(Box<GuildMembersChunkEvent>),
    /// Known name without a typed payload
    Other { kind: GatewayEventType, data: Value },
}

impl DispatchEvent {
    #[must_use]
    pub fn kind(&self) -> GatewayEventType {
        match self {
            Self::Ready(_) => GatewayEventType::Ready,
            Self::Resumed(_) => GatewayEventType::Resumed,
            Self::GuildCreate(_) => GatewayEventType::GuildCreate,
            Self::GuildDelete(_) => GatewayEventType::GuildDelete,
            Self::MessageCreate(_) => GatewayEventType::MessageCreate,
            Self::VoiceStateUpdate(_) => GatewayEventType::VoiceStateUpdate,
            Self::VoiceServerUpdate(_) => GatewayEventType::VoiceServerUpdate,
            Self::GuildMembersChunk(_) => GatewayEventType::GuildMembersChunk,
            Self::Other { kind, .. } => *kind,
        }
    }
}

type Decoder = fn(GatewayEventType, Value) -> Result<DispatchEvent, serde_json::Error>;

/// Lookup table from event name to decoder
#[derive(Debug, Clone)]
pub struct EventRegistry {
    decoders: HashMap<&'static str, (GatewayEventType, Decoder)>,
}

impl EventRegistry {
    /// Empty registry; every dispatch is treated as unknown
    #[must_use]
    pub fn empty() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Typed decoders for the core events, raw JSON for the other known names
    #[must_use]
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        for kind in GatewayEventType::ALL {
            registry.register(*kind, raw);
        }

        registry.register(GatewayEventType::Ready, |_, d| {
            Ok(DispatchEvent::Ready(Box::new(serde_json::from_value(d)?)))
        });
        registry.register(GatewayEventType::Resumed, |_, _| Ok(DispatchEvent::Resumed(ResumedEvent {})));
        registry.register(GatewayEventType::GuildCreate, |_, d| {
            Ok(DispatchEvent::GuildCreate(Box::new(serde_json::from_value(d)?)))
        });
        registry.register(GatewayEventType::GuildDelete, |_, d| {
            Ok(DispatchEvent::GuildDelete(serde_json::from_value(d)?))
        });
        registry.register(GatewayEventType::MessageCreate, |_, d| {
            Ok(DispatchEvent::MessageCreate(Box::new(serde_json::from_value(d)?)))
        });
        registry.register(GatewayEventType::VoiceStateUpdate, |_, d| {
            Ok(DispatchEvent::VoiceStateUpdate(Box::new(serde_json::from_value(d)?)))
        });
        registry.register(GatewayEventType::VoiceServerUpdate, |_, d| {
            Ok(DispatchEvent::VoiceServerUpdate(serde_json::from_value(d)?))
        });
        registry.register(GatewayEventType::GuildMembersChunk, |_, d| {
            Ok(DispatchEvent::GuildMembersChunk(Box::new(serde_json::from_value(d)?)))
        });

        registry
    }

    /// Replace the decoder for one event name
    pub fn register(&mut self, kind: GatewayEventType, decoder: Decoder) {
        self.decoders.insert(kind.as_str(), (kind, decoder));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.decoders.contains_key(name)
    }

    /// `None` for names without a decoder
    pub fn decode(&self, name: &str, data: Value) -> Option<Result<DispatchEvent, serde_json::Error>> {
        let (kind, decoder) = self.decoders.get(name)?;
        Some(decoder(*kind, data))
    }
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

fn raw(kind: GatewayEventType, data: Value) -> Result<DispatchEvent, serde_json::Error> {
    Ok(DispatchEvent::Other { kind, data })
}
