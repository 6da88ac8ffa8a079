//! Core primitives shared by the network layer.

pub mod token;

pub use token::{handshake_signature, Token, HANDSHAKE_TOKEN_LENGTH};
