//! Handshake Tokens
//!
//! Random challenge tokens issued to each player channel, and the
//! signature a client must return to prove it knows its session identity.

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use md5::{Digest, Md5};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};

/// Number of random bytes in a handshake challenge.
pub const HANDSHAKE_TOKEN_LENGTH: usize = 32;

/// A base64-encoded random challenge.
///
/// Immutable once generated. Lives only for the lifetime of the
/// connection it was issued to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// Number of random bytes before encoding.
    length: usize,
    /// Standard base64 of the random bytes.
    value: String,
}

impl Token {
    /// Generate a token of `length` bytes from the OS entropy source.
    pub fn generate(length: usize) -> Self {
        let mut bytes = vec![0u8; length];
        OsRng.fill_bytes(&mut bytes);
        Self::from_bytes(&bytes)
    }

    /// Build a token from already-chosen bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            length: bytes.len(),
            value: BASE64_STANDARD.encode(bytes),
        }
    }

    /// Random byte count.
    pub fn len(&self) -> usize {
        self.length
    }

    /// True for a zero-length token.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Encoded value as sent to the client.
    pub fn value(&self) -> &str {
        &self.value
    }
}

/// Compute the handshake signature for an identity and token value.
///
/// `base64(MD5(identity ++ token))` over the UTF-8 bytes. Both ends of the
/// protocol must agree on this exact construction, so it is not a place
/// for a stronger MAC without a protocol change.
pub fn handshake_signature(identity: &str, token_value: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(identity.as_bytes());
    hasher.update(token_value.as_bytes());
    BASE64_STANDARD.encode(hasher.finalize())
}

// =============================================================================
// TESTS
// =============================================================================
