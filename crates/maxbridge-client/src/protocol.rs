//! The framed JSON protocol spoken by the user WebSocket client.
//!
//! Every frame is a JSON object `{ver, cmd, seq, opcode, payload?}`.
//! `seq` is a monotone counter on the sender side; responses and errors copy
//! the `seq` of the originating request. Server-originated requests carry the
//! server's own `seq` and are answered with a response frame keyed on the
//! same `seq` and `opcode`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version carried in every frame.
pub const PROTOCOL_VERSION: u8 = 11;

/// Frame command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmd {
    /// A request expecting a response.
    Request,
    /// A response or acknowledgement to a request.
    Response,
    /// A standalone acknowledgement.
    Ack,
    /// An error response.
    Error,
}

impl Cmd {
    /// Decode the wire value.
    #[must_use]
    pub const fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Request),
            1 => Some(Self::Response),
            2 => Some(Self::Ack),
            3 => Some(Self::Error),
            _ => None,
        }
    }

    /// The wire value.
    #[must_use]
    pub const fn as_wire(self) -> u8 {
        match self {
            Self::Request => 0,
            Self::Response => 1,
            Self::Ack => 2,
            Self::Error => 3,
        }
    }
}

/// Opcodes of the framed protocol.
///
/// Only the operations the bridge uses are named here. Chat history
/// (opcode 53) is deliberately absent: fetching it is known to get the
/// connection dropped upstream.
pub mod opcode {
    /// Keepalive; sent every 30 seconds, server pings must be echoed.
    pub const HEARTBEAT: u16 = 1;
    /// Hand over the user-agent descriptor and device id.
    pub const INIT_SESSION: u16 = 6;
    /// Start or re-send phone + SMS authentication.
    pub const START_PHONE_AUTH: u16 = 17;
    /// Submit the SMS verification code.
    pub const CHECK_CODE: u16 = 18;
    /// Authenticate with a saved login token.
    pub const LOGIN_BY_TOKEN: u16 = 19;
    /// Fetch chat metadata (and optionally the member list).
    pub const CHAT_INFO: u16 = 49;
    /// Move the own read marker.
    pub const MARK_READ: u16 = 50;
    /// Send a message.
    pub const SEND_MESSAGE: u16 = 64;
    /// Delete a message.
    pub const DELETE_MESSAGE: u16 = 66;
    /// Edit a message.
    pub const EDIT_MESSAGE: u16 = 67;
    /// New message in a subscribed chat (server-originated, must be acked).
    pub const INCOMING_MESSAGE: u16 = 128;
    /// Message edit (server-originated).
    pub const INCOMING_EDIT: u16 = 129;
    /// Message deletion (server-originated).
    pub const INCOMING_DELETE: u16 = 130;
    /// Peer read marker (server-originated).
    pub const INCOMING_READ: u16 = 131;
    /// Peer typing notification (server-originated).
    pub const INCOMING_TYPING: u16 = 132;
    /// Add or remove a reaction.
    pub const REACT: u16 = 178;
    /// Generate a QR login code.
    pub const QR_GENERATE: u16 = 288;
    /// Poll a QR login for completion.
    pub const QR_POLL: u16 = 289;
    /// Confirm a scanned QR login and obtain the token.
    pub const QR_CONFIRM: u16 = 291;
}

/// One protocol frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    /// Protocol version.
    pub ver: u8,
    /// Frame command (see [`Cmd`]).
    pub cmd: u8,
    /// Sequence number.
    pub seq: u64,
    /// Operation code.
    pub opcode: u16,
    /// Operation payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Frame {
    /// Build a request frame.
    #[must_use]
    pub fn request(seq: u64, opcode: u16, payload: Value) -> Self {
        Self {
            ver: PROTOCOL_VERSION,
            cmd: Cmd::Request.as_wire(),
            seq,
            opcode,
            payload: Some(payload),
        }
    }

    /// Build a response frame answering a server-originated request.
    #[must_use]
    pub fn response(seq: u64, opcode: u16, payload: Value) -> Self {
        Self {
            ver: PROTOCOL_VERSION,
            cmd: Cmd::Response.as_wire(),
            seq,
            opcode,
            payload: Some(payload),
        }
    }

    /// The decoded command, if valid.
    #[must_use]
    pub const fn command(&self) -> Option<Cmd> {
        Cmd::from_wire(self.cmd)
    }
}

/// Build the `INIT_SESSION` payload.
///
/// The server fingerprints the session on this descriptor; the shape mirrors
/// what the Max web client sends. The device id stays stable across
/// reconnects and is regenerated only on clean logout.
#[must_use]
pub fn session_init_payload(device_id: &str) -> Value {
    serde_json::json!({
        "userAgent": {
            "deviceType": "WEB",
            "locale": "ru",
            "osVersion": "Linux",
            "deviceName": "maxbridge",
            "appVersion": "25.7.10",
            "screen": "1920x1080 1.0x",
            "timezone": "Europe/Moscow",
        },
        "deviceId": device_id,
    })
}

/// Build the `LOGIN_BY_TOKEN` payload.
#[must_use]
pub fn login_by_token_payload(token: &str, chats_count: u32) -> Value {
    serde_json::json!({
        "token": token,
        "chatsCount": chats_count,
        "lastLogin": 0,
    })
}

/// Pull the server error code and message out of a `cmd=3` payload.
#[must_use]
pub fn decode_error_payload(payload: Option<&Value>) -> (String, String) {
    let Some(payload) = payload else {
        return ("unknown".to_string(), "no payload".to_string());
    };
    let code = payload
        .get("error")
        .or_else(|| payload.get("code"))
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let message = payload
        .get("message")
        .or_else(|| payload.get("localizedMessage"))
        .and_then(Value::as_str)
        .map_or_else(|| payload.to_string(), str::to_string);
    (code, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frame_roundtrip() {
        let frame = Frame::request(3, opcode::SEND_MESSAGE, json!({"chatId": 1}));
        let encoded = serde_json::to_string(&frame).unwrap();
        let decoded: Frame = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.ver, PROTOCOL_VERSION);
        assert_eq!(decoded.command(), Some(Cmd::Request));
        assert_eq!(decoded.seq, 3);
        assert_eq!(decoded.opcode, opcode::SEND_MESSAGE);
    }

    #[test]
    fn payload_omitted_when_absent() {
        let frame = Frame {
            ver: PROTOCOL_VERSION,
            cmd: Cmd::Response.as_wire(),
            seq: 1,
            opcode: opcode::HEARTBEAT,
            payload: None,
        };
        let encoded = serde_json::to_string(&frame).unwrap();
        assert!(!encoded.contains("payload"));
    }

    #[test]
    fn cmd_wire_values() {
        for cmd in [Cmd::Request, Cmd::Response, Cmd::Ack, Cmd::Error] {
            assert_eq!(Cmd::from_wire(cmd.as_wire()), Some(cmd));
        }
        assert_eq!(Cmd::from_wire(9), None);
    }

    #[test]
    fn error_payload_decoding() {
        let (code, message) =
            decode_error_payload(Some(&json!({"error": "login.token", "message": "bad token"})));
        assert_eq!(code, "login.token");
        assert_eq!(message, "bad token");

        let (code, _) = decode_error_payload(None);
        assert_eq!(code, "unknown");
    }
}
