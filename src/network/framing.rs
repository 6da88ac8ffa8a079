//! Frame Unpacking
//!
//! Turns received WebSocket messages into text payloads ready for
//! envelope parsing. Fragment reassembly is done by tungstenite; what is
//! left here is zero padding, which clients writing fixed-size buffers
//! leave after the real payload.

use tokio_tungstenite::tungstenite::Message;

/// What a single receive attempt produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// Text payload with padding removed. May be empty.
    Text(String),
    /// Binary frame. Unsupported; treated as an empty payload.
    Binary,
    /// Peer sent a close frame.
    Close,
    /// Ping/pong or raw frame; nothing for the protocol layer.
    Control,
}

impl Received {
    /// Payload for the parser. Anything but text parses as empty.
    pub fn into_text(self) -> String {
        match self {
            Received::Text(text) => text,
            _ => String::new(),
        }
    }
}

/// Truncate after the last non-zero byte.
///
/// An all-zero buffer reduces to empty.
pub fn strip_padding(bytes: &[u8]) -> &[u8] {
    match bytes.iter().rposition(|&b| b != 0) {
        Some(last) => &bytes[..=last],
        None => &[],
    }
}

/// Classify a received message and unpad text.
pub fn unframe(message: Message) -> Received {
    match message {
        Message::Text(mut text) => {
            // NUL is a single-byte code point, so the cut is a char boundary.
            let len = strip_padding(text.as_bytes()).len();
            text.truncate(len);
            Received::Text(text)
        }
        Message::Binary(_) => Received::Binary,
        Message::Close(_) => Received::Close,
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Received::Control,
    }
}
