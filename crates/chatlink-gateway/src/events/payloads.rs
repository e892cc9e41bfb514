//! Typed dispatch payloads
//!
//! Only the fields the client acts on are modelled; unknown fields are ignored.

use crate::protocol::Snowflake;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// READY
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyEvent {
    pub v: u8,
    pub user: UserPayload,
    #[serde(default)]
    pub guilds: Vec<UnavailableGuild>,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_gateway_url: Option<String>,
    /// `[shard_id, shard_count]`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard: Option<[u32; 2]>,
}

/// RESUMED carries no useful data
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResumedEvent {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnavailableGuild {
    pub id: Snowflake,
    #[serde(default)]
    pub unavailable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPayload {
    pub id: Snowflake,
    pub username: String,
    #[serde(default)]
    pub discriminator: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub bot: bool,
}

/// GUILD_CREATE
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuildCreateEvent {
    pub id: Snowflake,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub owner_id: Option<Snowflake>,
    #[serde(default)]
    pub member_count: u64,
    #[serde(default)]
    pub large: bool,
    #[serde(default)]
    pub unavailable: bool,
    #[serde(default)]
    pub voice_states: Vec<VoiceStateEvent>,
    /// Channels, roles and the rest, left undecoded
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// GUILD_DELETE
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuildDeleteEvent {
    pub id: Snowflake,
    /// Set during an outage; absent when the client left the guild
    #[serde(default)]
    pub unavailable: bool,
}

/// MESSAGE_CREATE
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageCreateEvent {
    pub id: Snowflake,
    pub channel_id: Snowflake,
    #[serde(default)]
    pub guild_id: Option<Snowflake>,
    pub author: UserPayload,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// VOICE_STATE_UPDATE
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceStateEvent {
    #[serde(default)]
    pub guild_id: Option<Snowflake>,
    pub channel_id: Option<Snowflake>,
    pub user_id: Snowflake,
    pub session_id: String,
    #[serde(default)]
    pub self_mute: bool,
    #[serde(default)]
    pub self_deaf: bool,
}

/// VOICE_SERVER_UPDATE
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceServerUpdateEvent {
    pub token: String,
    pub guild_id: Snowflake,
    /// `None` while the voice server is being reallocated
    pub endpoint: Option<String>,
}

/// GUILD_MEMBERS_CHUNK
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuildMembersChunkEvent {
    pub guild_id: Snowflake,
    #[serde(default)]
    pub members: Vec<MemberPayload>,
    pub chunk_index: u32,
    pub chunk_count: u32,
    #[serde(default)]
    pub not_found: Vec<Snowflake>,
    #[serde(default)]
    pub nonce: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberPayload {
    #[serde(default)]
    pub user: Option<UserPayload>,
    #[serde(default)]
    pub nick: Option<String>,
    #[serde(default)]
    pub roles: Vec<Snowflake>,
    #[serde(default)]
    pub joined_at: Option<String>,
}
