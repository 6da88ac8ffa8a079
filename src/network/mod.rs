//! Network Layer
//!
//! HTTP control server plus one WebSocket channel per joined player.

pub mod admin;
pub mod connection;
pub mod framing;
pub mod pages;
pub mod protocol;
pub mod roster;
pub mod server;

pub use admin::{AdminCommand, AdminError};
pub use connection::{ConnectionError, ConnectionPhase, PlayerConnection, PlayerIdentity};
pub use protocol::{ClientEnvelope, MessageKind, PacketResponse, ServerMessage};
pub use roster::{JoinError, JoinPolicy, JoinRequest, PlayerRecord, Roster};
pub use server::{
    ConfigError, GameServer, GameServerError, RequestError, ServerConfig, ServerState,
};
