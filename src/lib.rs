//! # TGC Session Server
//!
//! Session server for small multiplayer matches. Clients join over HTTP and
//! each joined player gets a dedicated WebSocket channel on its own port.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     TGC SESSION SERVER                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Shared primitives                         │
//! │  └── token.rs    - Handshake tokens and signatures           │
//! │                                                              │
//! │  network/        - Control server and player channels        │
//! │  ├── server.rs   - HTTP dispatcher, config, shared state     │
//! │  ├── roster.rs   - Joined players and join policy            │
//! │  ├── admin.rs    - Authenticated operator commands           │
//! │  ├── pages.rs    - Static pages for browser GETs             │
//! │  ├── connection.rs - Per-player channel engine               │
//! │  ├── protocol.rs - Channel message kinds and envelopes       │
//! │  └── framing.rs  - Frame decoding and padding removal        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Channel Lifecycle
//!
//! A player channel listens on its assigned port, accepts one WebSocket,
//! challenges the client with a random token and only exchanges game
//! messages once the client answers with the matching signature.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod network;

// Re-export commonly used types
pub use crate::core::token::{handshake_signature, Token};
pub use network::protocol::{MessageKind, ServerMessage};
pub use network::server::{GameServer, ServerConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
