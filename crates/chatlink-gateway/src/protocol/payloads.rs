//! Payload definitions
//!
//! `Hello` is received; everything else here is sent by the client.

use super::{Intents, Snowflake};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Payload for op 10 (Hello)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloPayload {
    /// Milliseconds
    pub heartbeat_interval: u64,
    #[serde(default, rename = "_trace", skip_serializing_if = "Vec::is_empty")]
    pub trace: Vec<String>,
}

/// Payload for op 2 (Identify)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyPayload {
    pub token: String,
    pub properties: IdentifyProperties,
    /// Always false; compression happens at the transport level
    pub compress: bool,
    pub large_threshold: u32,
    /// `[shard_id, shard_count]`, only sent when sharding
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<[u32; 2]>,
    pub intents: Intents,
}

impl IdentifyPayload {
    #[must_use]
    pub fn new(token: impl Into<String>, intents: Intents, large_threshold: u32) -> Self {
        Self {
            token: token.into(),
            properties: IdentifyProperties::default(),
            compress: false,
            large_threshold,
            shard: None,
            intents,
        }
    }

    /// A single shard identifies without the `shard` field
    #[must_use]
    pub fn with_shard(mut self, shard_id: u32, shard_count: u32) -> Self {
        self.shard = (shard_count > 1).then_some([shard_id, shard_count]);
        self
    }
}

/// Client connection properties
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyProperties {
    #[serde(rename = "$os")]
    pub os: String,
    #[serde(rename = "$browser")]
    pub browser: String,
    #[serde(rename = "$device")]
    pub device: String,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: "chatlink".to_string(),
            device: "chatlink".to_string(),
        }
    }
}

/// Payload for op 6 (Resume)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumePayload {
    pub token: String,
    pub session_id: String,
    pub seq: u64,
}

/// Kind of activity shown in a presence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityType {
    Playing,
    Streaming,
    Listening,
    Watching,
    Custom,
    Competing,
}

impl ActivityType {
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Playing => 0,
            Self::Streaming => 1,
            Self::Listening => 2,
            Self::Watching => 3,
            Self::Custom => 4,
            Self::Competing => 5,
        }
    }

    /// Unknown values read as `Playing`
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Streaming,
            2 => Self::Listening,
            3 => Self::Watching,
            4 => Self::Custom,
            5 => Self::Competing,
            _ => Self::Playing,
        }
    }
}

impl Serialize for ActivityType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for ActivityType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        u8::deserialize(deserializer).map(Self::from_u8)
    }
}

/// Activity shown in a presence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ActivityType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

/// Payload for op 3 (Status Update)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStatusData {
    /// Unix time the client went idle; only set for `idle`
    pub since: Option<i64>,
    pub game: Option<Activity>,
    pub afk: bool,
    /// `online`, `idle`, `dnd`, `invisible` or `offline`
    pub status: String,
}

impl UpdateStatusData {
    /// Presence with an optional activity
    ///
    /// An empty `text` clears the activity. A streaming URL forces the streaming type.
    #[must_use]
    pub fn new(kind: ActivityType, status: impl Into<String>, text: &str, url: Option<&str>) -> Self {
        let status = status.into();
        let since = (status == "idle").then(|| chrono::Utc::now().timestamp());
        let kind = if url.is_some_and(|u| !u.is_empty()) {
            ActivityType::Streaming
        } else {
            kind
        };

        let game = (!text.is_empty()).then(|| Activity {
            name: text.to_string(),
            kind,
            url: url.filter(|u| !u.is_empty()).map(str::to_string),
            state: Some(text.to_string()),
        });

        Self {
            since,
            game,
            afk: false,
            status,
        }
    }

    #[must_use]
    pub fn playing(text: &str, status: impl Into<String>) -> Self {
        Self::new(ActivityType::Playing, status, text, None)
    }

    #[must_use]
    pub fn streaming(text: &str, status: impl Into<String>, url: &str) -> Self {
        Self::new(ActivityType::Streaming, status, text, Some(url))
    }

    #[must_use]
    pub fn listening(text: &str, status: impl Into<String>) -> Self {
        Self::new(ActivityType::Listening, status, text, None)
    }

    #[must_use]
    pub fn watching(text: &str, status: impl Into<String>) -> Self {
        Self::new(ActivityType::Watching, status, text, None)
    }

    #[must_use]
    pub fn custom(text: &str, status: impl Into<String>) -> Self {
        Self::new(ActivityType::Custom, status, text, None)
    }

    #[must_use]
    pub fn competing(text: &str, status: impl Into<String>) -> Self {
        Self::new(ActivityType::Competing, status, text, None)
    }
}

/// Payload for op 4 (Voice State Update)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceStateUpdatePayload {
    pub guild_id: Snowflake,
    /// `None` leaves the voice channel
    pub channel_id: Option<Snowflake>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

/// Payload for op 8 (Request Guild Members)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestGuildMembersData {
    pub guild_id: Snowflake,
    pub limit: u32,
    #[serde(default)]
    pub presences: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_ids: Vec<Snowflake>,
    /// Echoed back in the matching GUILD_MEMBERS_CHUNK events
    #[serde(default)]
    pub nonce: String,
}

impl RequestGuildMembersData {
    #[must_use]
    pub fn new(guild_id: Snowflake, limit: u32) -> Self {
        Self {
            guild_id,
            limit,
            presences: false,
            query: None,
            user_ids: Vec::new(),
            nonce: uuid::Uuid::new_v4().simple().to_string(),
        }
    }

    #[must_use]
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    #[must_use]
    pub fn with_user_ids(mut self, user_ids: Vec<Snowflake>) -> Self {
        self.user_ids = user_ids;
        self
    }
}
