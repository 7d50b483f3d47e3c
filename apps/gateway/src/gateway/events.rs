//! Gateway opcodes and the `{op, d, t}` envelope carried on the wire.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

// Opcode 2 is not sent on the wire; transport loss runs `handler::disconnect`.
pub const OP_AUTHENTICATE: u8 = 1;
pub const OP_JOIN_ROOM: u8 = 3;
pub const OP_LEAVE_ROOM: u8 = 4;
pub const OP_ADD_USER: u8 = 5;
pub const OP_REMOVE_USER: u8 = 6;
pub const OP_ROOM_JOIN_REQUEST: u8 = 7;
pub const OP_ERROR: u8 = 8;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// One message in either direction.
///
/// `t` is milliseconds since the Unix epoch. Producers may leave it unset;
/// it is filled with the current time before the envelope leaves the process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<i64>,
}

impl Envelope {
    /// Build an envelope, stamping it with `time` or now.
    pub fn new(op: u8, d: Value, time: Option<i64>) -> Self {
        Self {
            op,
            d,
            t: Some(time.unwrap_or_else(roomcast_common::time::now_ms)),
        }
    }

    pub fn with_data<T: Serialize>(op: u8, data: &T, time: Option<i64>) -> Result<Self, GatewayError> {
        Ok(Self::new(op, serde_json::to_value(data)?, time))
    }

    /// Fill `t` if the producer omitted it.
    pub fn stamp(&mut self) {
        if self.t.is_none() {
            self.t = Some(roomcast_common::time::now_ms());
        }
    }

    /// Decode the payload into a typed struct.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, GatewayError> {
        Ok(serde_json::from_value(self.d.clone())?)
    }
}

// ---------------------------------------------------------------------------
// Inbound payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatePayload {
    pub token: String,
    #[serde(default)]
    pub session_id: Option<String>,
}
