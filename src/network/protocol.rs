//! Protocol Messages
//!
//! Wire format for the per-player WebSocket channel.
//! Every frame is a UTF-8 JSON object tagged with a `t` field naming one
//! kind from a closed set. Kinds are emitted as names; the numeric index
//! of the kind is accepted on input for older clients.

use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};

use crate::core::token::Token;

/// Response text for a server-only kind received from a client.
pub const MSG_SERVER_ONLY: &str = "client attempted to send a server-only packet";
/// Response text for a handshake reply after authentication.
pub const MSG_HANDSHAKE_DONE: &str = "handshake already completed";
/// Response text for anything the dispatch table does not handle.
pub const MSG_UNPROCESSABLE: &str = "unable to process packet";

// =============================================================================
// MESSAGE TAXONOMY
// =============================================================================

/// Which side of the channel may originate a message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Only the server sends this kind.
    ServerToClient,
    /// Only the client sends this kind.
    ClientToServer,
}

/// Closed set of message kinds on the player channel.
///
/// Declaration order is the numeric wire index and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Server issues a challenge token.
    StartHandshake,
    /// Client answers a challenge with a signature.
    RespondToHandshake,
    /// Server accepts the signature.
    ConfirmHandshake,
    /// Server rejects a request.
    RequestError,
    /// Client liveness probe.
    Ping,
    /// Server answer to a ping.
    PingResponse,
    /// Client reports its position.
    SyncPosition,
    /// Server pushes other players' positions.
    PeerPositions,
}

impl MessageKind {
    /// Every kind, in wire index order.
    pub const ALL: [MessageKind; 8] = [
        MessageKind::StartHandshake,
        MessageKind::RespondToHandshake,
        MessageKind::ConfirmHandshake,
        MessageKind::RequestError,
        MessageKind::Ping,
        MessageKind::PingResponse,
        MessageKind::SyncPosition,
        MessageKind::PeerPositions,
    ];

    /// Direction this kind travels.
    pub fn direction(self) -> Direction {
        match self {
            MessageKind::StartHandshake
            | MessageKind::ConfirmHandshake
            | MessageKind::RequestError
            | MessageKind::PingResponse
            | MessageKind::PeerPositions => Direction::ServerToClient,
            MessageKind::RespondToHandshake
            | MessageKind::Ping
            | MessageKind::SyncPosition => Direction::ClientToServer,
        }
    }

    /// True if a client must never send this kind.
    pub fn is_server_only(self) -> bool {
        self.direction() == Direction::ServerToClient
    }

    /// Wire name.
    pub fn name(self) -> &'static str {
        match self {
            MessageKind::StartHandshake => "StartHandshake",
            MessageKind::RespondToHandshake => "RespondToHandshake",
            MessageKind::ConfirmHandshake => "ConfirmHandshake",
            MessageKind::RequestError => "RequestError",
            MessageKind::Ping => "Ping",
            MessageKind::PingResponse => "PingResponse",
            MessageKind::SyncPosition => "SyncPosition",
            MessageKind::PeerPositions => "PeerPositions",
        }
    }

    /// Numeric wire index.
    pub fn index(self) -> u8 {
        self as u8
    }

    /// Look up a kind by wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.name() == name)
    }

    /// Look up a kind by numeric wire index.
    pub fn from_index(index: u64) -> Option<Self> {
        usize::try_from(index)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for MessageKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

struct MessageKindVisitor;

impl<'de> Visitor<'de> for MessageKindVisitor {
    type Value = MessageKind;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a message kind name or index")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<MessageKind, E> {
        MessageKind::from_name(v)
            .ok_or_else(|| E::custom(format!("unknown message kind '{}'", v)))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<MessageKind, E> {
        MessageKind::from_index(v)
            .ok_or_else(|| E::custom(format!("unknown message kind index {}", v)))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<MessageKind, E> {
        u64::try_from(v)
            .ok()
            .and_then(MessageKind::from_index)
            .ok_or_else(|| E::custom(format!("unknown message kind index {}", v)))
    }
}

impl<'de> Deserialize<'de> for MessageKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(MessageKindVisitor)
    }
}

// =============================================================================
// CLIENT -> SERVER
// =============================================================================

/// Errors decoding an inbound frame.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Frame carried no payload.
    #[error("empty message")]
    Empty,

    /// Payload is not a valid envelope.
    #[error("invalid envelope: {0}")]
    Json(#[from] serde_json::Error),
}

/// A decoded client frame.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientEnvelope {
    /// Message kind.
    pub t: MessageKind,
    /// Handshake signature (only on `RespondToHandshake`).
    #[serde(default)]
    pub s: Option<String>,
    /// Kind-specific payload.
    #[serde(default)]
    pub data: Option<Value>,
}

impl ClientEnvelope {
    /// Parse an unframed text payload.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        if text.is_empty() {
            return Err(ProtocolError::Empty);
        }
        Ok(serde_json::from_str(text)?)
    }

    /// Message kind.
    pub fn kind(&self) -> MessageKind {
        self.t
    }

    /// Signature field, if present.
    pub fn signature(&self) -> Option<&str> {
        self.s.as_deref()
    }
}

// =============================================================================
// SERVER -> CLIENT
// =============================================================================

/// Messages the server originates on a player channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Handshake challenge.
    StartHandshake(Token),
    /// Handshake accepted.
    ConfirmHandshake,
    /// Unsolicited error notice.
    RequestError {
        /// Human-readable message.
        msg: String,
    },
    /// Ping answer.
    PingResponse,
    /// Other players' positions.
    PeerPositions(Value),
}

impl ServerMessage {
    /// Kind tag of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            ServerMessage::StartHandshake(_) => MessageKind::StartHandshake,
            ServerMessage::ConfirmHandshake => MessageKind::ConfirmHandshake,
            ServerMessage::RequestError { .. } => MessageKind::RequestError,
            ServerMessage::PingResponse => MessageKind::PingResponse,
            ServerMessage::PeerPositions(_) => MessageKind::PeerPositions,
        }
    }

    /// Build the wire envelope.
    pub fn to_value(&self) -> Value {
        let t = self.kind();
        match self {
            ServerMessage::StartHandshake(token) => json!({ "t": t, "token": token }),
            ServerMessage::ConfirmHandshake => json!({ "t": t }),
            ServerMessage::RequestError { msg } => json!({ "t": t, "data": { "msg": msg } }),
            ServerMessage::PingResponse => json!({ "t": t, "data": { "acknowledged": true } }),
            ServerMessage::PeerPositions(data) => json!({ "t": t, "data": data }),
        }
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> String {
        self.to_value().to_string()
    }
}

/// Synchronous reply to one post-handshake client frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PacketResponse {
    /// Whether the request was handled.
    pub ok: bool,
    /// Kind of the reply.
    pub t: MessageKind,
    /// Reply payload.
    pub data: Map<String, Value>,
}

impl PacketResponse {
    /// Successful reply.
    pub fn ok(t: MessageKind, data: Map<String, Value>) -> Self {
        Self { ok: true, t, data }
    }

    /// `RequestError` reply carrying `msg`.
    pub fn error(msg: &str) -> Self {
        let mut data = Map::new();
        data.insert("msg".into(), Value::String(msg.to_string()));
        Self {
            ok: false,
            t: MessageKind::RequestError,
            data,
        }
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_order_is_stable() {
        for (i, kind) in MessageKind::ALL.iter().enumerate() {
            assert_eq!(kind.index() as usize, i);
            assert_eq!(MessageKind::from_index(i as u64), Some(*kind));
        }
        assert_eq!(MessageKind::from_index(8), None);
    }

    #[test]
    fn test_directions() {
        assert!(MessageKind::StartHandshake.is_server_only());
        assert!(MessageKind::ConfirmHandshake.is_server_only());
        assert!(MessageKind::RequestError.is_server_only());
        assert!(MessageKind::PingResponse.is_server_only());
        assert!(MessageKind::PeerPositions.is_server_only());
        assert!(!MessageKind::RespondToHandshake.is_server_only());
        assert!(!MessageKind::Ping.is_server_only());
        assert!(!MessageKind::SyncPosition.is_server_only());
        assert_eq!(MessageKind::Ping.direction(), Direction::ClientToServer);
    }

    #[test]
    fn test_parse_by_name_and_index() {
        let by_name = ClientEnvelope::parse(r#"{"t":"RespondToHandshake","s":"abc"}"#).unwrap();
        assert_eq!(by_name.kind(), MessageKind::RespondToHandshake);
        assert_eq!(by_name.signature(), Some("abc"));

        let by_index = ClientEnvelope::parse(r#"{"t":1,"s":"abc"}"#).unwrap();
        assert_eq!(by_index.kind(), MessageKind::RespondToHandshake);
    }

    #[test]
    fn test_parse_rejects_unknown_kind() {
        assert!(ClientEnvelope::parse(r#"{"t":"Teleport"}"#).is_err());
        assert!(ClientEnvelope::parse(r#"{"t":42}"#).is_err());
        assert!(ClientEnvelope::parse(r#"{"t":-1}"#).is_err());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(ClientEnvelope::parse(""), Err(ProtocolError::Empty)));
        assert!(ClientEnvelope::parse("null").is_err());
        assert!(ClientEnvelope::parse("{\"s\":\"x\"}").is_err());
        assert!(ClientEnvelope::parse("{not json").is_err());
    }

    #[test]
    fn test_parse_keeps_data() {
        let env = ClientEnvelope::parse(r#"{"t":"SyncPosition","data":{"x":1.5,"y":-2}}"#).unwrap();
        assert_eq!(env.kind(), MessageKind::SyncPosition);
        assert_eq!(env.data.unwrap()["x"], 1.5);
    }

    #[test]
    fn test_start_handshake_shape() {
        let token = Token::from_bytes(&[1, 2, 3]);
        let value = ServerMessage::StartHandshake(token).to_value();
        assert_eq!(
            value,
            json!({ "t": "StartHandshake", "token": { "length": 3, "value": "AQID" } })
        );
    }

    #[test]
    fn test_confirm_has_no_data() {
        let value = ServerMessage::ConfirmHandshake.to_value();
        assert_eq!(value, json!({ "t": "ConfirmHandshake" }));
    }

    #[test]
    fn test_peer_positions_shape() {
        let msg = ServerMessage::PeerPositions(json!({ "Ada": [1, 2] }));
        assert_eq!(msg.kind(), MessageKind::PeerPositions);
        assert_eq!(msg.to_value(), json!({ "t": "PeerPositions", "data": { "Ada": [1, 2] } }));
    }

    #[test]
    fn test_error_response_shape() {
        let json = PacketResponse::error(MSG_SERVER_ONLY).to_json().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(
            value,
            json!({ "ok": false, "t": "RequestError", "data": { "msg": MSG_SERVER_ONLY } })
        );
    }
}
