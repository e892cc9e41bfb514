//! Envelope formats
//!
//! Inbound envelopes keep the raw op so unknown codes can be logged instead of
//! failing the decode.

use super::{
    IdentifyPayload, OpCode, RequestGuildMembersData, ResumePayload, UpdateStatusData, VoiceStateUpdatePayload,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Envelope received from the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayPayload {
    pub op: u64,
    #[serde(default)]
    pub d: Option<Value>,
    /// Only present on dispatches
    #[serde(default)]
    pub s: Option<u64>,
    /// Event name, only present on dispatches
    #[serde(default)]
    pub t: Option<String>,
}

impl GatewayPayload {
    pub fn opcode(&self) -> Option<OpCode> {
        u8::try_from(self.op).ok().and_then(OpCode::from_u8)
    }

    /// Take the data field, leaving `null` behind
    pub fn take_data(&mut self) -> Value {
        self.d.take().unwrap_or(Value::Null)
    }
}

impl fmt::Display for GatewayPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.opcode() {
            Some(op) => write!(f, "op={op}")?,
            None => write!(f, "op=unknown ({})", self.op)?,
        }
        if let Some(s) = self.s {
            write!(f, " s={s}")?;
        }
        if let Some(t) = &self.t {
            write!(f, " t={t}")?;
        }
        Ok(())
    }
}

/// Envelope sent to the gateway
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutgoingMessage {
    pub op: OpCode,
    pub d: Value,
}

impl OutgoingMessage {
    pub fn new(op: OpCode, data: impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Self {
            op,
            d: serde_json::to_value(data)?,
        })
    }

    /// Heartbeat carrying the last seen sequence; `null` before the first dispatch
    #[must_use]
    pub fn heartbeat(sequence: u64) -> Self {
        let d = if sequence == 0 {
            Value::Null
        } else {
            Value::from(sequence)
        };
        Self { op: OpCode::Heartbeat, d }
    }

    pub fn identify(payload: &IdentifyPayload) -> Result<Self, serde_json::Error> {
        Self::new(OpCode::Identify, payload)
    }

    pub fn resume(payload: &ResumePayload) -> Result<Self, serde_json::Error> {
        Self::new(OpCode::Resume, payload)
    }

    pub fn status_update(payload: &UpdateStatusData) -> Result<Self, serde_json::Error> {
        Self::new(OpCode::StatusUpdate, payload)
    }

    pub fn voice_state_update(payload: &VoiceStateUpdatePayload) -> Result<Self, serde_json::Error> {
        Self::new(OpCode::VoiceStateUpdate, payload)
    }

    pub fn request_guild_members(payload: &RequestGuildMembersData) -> Result<Self, serde_json::Error> {
        Self::new(OpCode::RequestGuildMembers, payload)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
