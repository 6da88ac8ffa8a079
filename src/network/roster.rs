//! Player Roster
//!
//! The session directory: every joined player's record, and the join
//! policy (capacity, unique names, client version, port assignment).
//! Records own their [`PlayerConnection`]; dropping a record closes its
//! channel.

use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

use crate::network::connection::{ConnectionError, PlayerConnection, PlayerIdentity};

/// A joined player.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerRecord {
    /// Display name, unique among active players.
    pub name: String,
    /// When the join was accepted.
    pub joined_at: DateTime<Utc>,
    /// Session identity; the handshake signature is derived from it.
    #[serde(rename = "guid")]
    pub identity: Uuid,
    /// Remote address of the join request.
    #[serde(rename = "ip")]
    pub remote_address: String,
    /// Version string the client reported.
    pub client_version: String,
    /// Port of the player's dedicated channel.
    #[serde(rename = "socketPort")]
    pub assigned_port: u16,
    /// The player's channel.
    #[serde(skip)]
    pub connection: PlayerConnection,
}

/// Fields of a `player`/`join` request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    /// Requested display name.
    pub name: String,
    /// Client build version.
    pub client_version: String,
}

impl JoinRequest {
    /// Extract from a request packet.
    pub fn from_packet(packet: &Value) -> Result<Self, JoinError> {
        Self::deserialize(packet).map_err(|e| JoinError::InvalidRequest(e.to_string()))
    }
}

/// Join policy errors.
#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    /// Roster is at capacity.
    #[error("The server is full")]
    ServerFull,

    /// Name already taken.
    #[error("A player already exists with that name")]
    NameTaken,

    /// Client build differs from the allowed version.
    #[error("Client version '{got}' does not match the server's allowed version '{expected}'")]
    VersionMismatch {
        /// Configured version.
        expected: String,
        /// Version the client sent.
        got: String,
    },

    /// No port left above the base port.
    #[error("No free player ports")]
    PortsExhausted,

    /// Request lacked a field or had the wrong type.
    #[error("Invalid join request: {0}")]
    InvalidRequest(String),

    /// Could not open the player's channel.
    #[error("Failed to open player channel: {0}")]
    Channel(#[from] ConnectionError),
}

/// Settings a join is checked against.
#[derive(Debug, Clone)]
pub struct JoinPolicy {
    /// Address player endpoints bind to.
    pub bind_ip: IpAddr,
    /// Exact client version required, if any.
    pub allowed_version: Option<String>,
}

/// Active players, in join order.
#[derive(Debug)]
pub struct Roster {
    players: Vec<PlayerRecord>,
    max_players: usize,
    base_port: u16,
}

impl Roster {
    /// Create an empty roster.
    pub fn new(max_players: usize, base_port: u16) -> Self {
        Self {
            players: Vec::with_capacity(max_players),
            max_players,
            base_port,
        }
    }

    /// Number of active players.
    pub fn len(&self) -> usize {
        self.players.len()
    }

    /// True when nobody has joined.
    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Capacity.
    pub fn max_players(&self) -> usize {
        self.max_players
    }

    /// True at capacity.
    pub fn is_full(&self) -> bool {
        self.players.len() >= self.max_players
    }

    /// Records in join order.
    pub fn records(&self) -> &[PlayerRecord] {
        &self.players
    }

    /// Find a player by name.
    pub fn get(&self, name: &str) -> Option<&PlayerRecord> {
        self.players.iter().find(|p| p.name == name)
    }

    /// Lowest port above the base not held by an active player.
    ///
    /// While nobody leaves this is `base + 1 + len()`.
    pub fn next_port(&self) -> Option<u16> {
        let first = self.base_port.checked_add(1)?;
        (first..=u16::MAX).find(|port| self.players.iter().all(|p| p.assigned_port != *port))
    }

    /// Check a join against policy and pick its port. No side effects.
    pub fn admit(&self, request: &JoinRequest, policy: &JoinPolicy) -> Result<u16, JoinError> {
        if self.is_full() {
            return Err(JoinError::ServerFull);
        }
        if self.get(&request.name).is_some() {
            return Err(JoinError::NameTaken);
        }
        if let Some(expected) = &policy.allowed_version {
            if *expected != request.client_version {
                return Err(JoinError::VersionMismatch {
                    expected: expected.clone(),
                    got: request.client_version.clone(),
                });
            }
        }
        self.next_port().ok_or(JoinError::PortsExhausted)
    }

    /// Admit a player, open their channel and add the record.
    ///
    /// On any error the roster is unchanged.
    pub async fn join(
        &mut self,
        request: JoinRequest,
        remote: SocketAddr,
        policy: &JoinPolicy,
        shutdown: watch::Receiver<bool>,
    ) -> Result<&PlayerRecord, JoinError> {
        let port = self.admit(&request, policy)?;
        let identity = Uuid::new_v4();

        let connection = PlayerConnection::open(
            policy.bind_ip,
            port,
            PlayerIdentity {
                name: request.name.clone(),
                guid: identity,
            },
            shutdown,
        )
        .await?;

        self.insert(PlayerRecord {
            name: request.name,
            joined_at: Utc::now(),
            identity,
            remote_address: remote.to_string(),
            client_version: request.client_version,
            assigned_port: port,
            connection,
        });

        let record = &self.players[self.players.len() - 1];
        info!(
            "Player #{} '{}' ({}) joined from client v{}. Guid: {}",
            self.players.len(),
            record.name,
            record.remote_address,
            record.client_version,
            record.identity
        );
        Ok(record)
    }

    /// Add a record that has passed [`admit`](Self::admit).
    fn insert(&mut self, record: PlayerRecord) {
        self.players.push(record);
    }
}

// =============================================================================
// TESTS
// =============================================================================
