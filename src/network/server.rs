//! Control Server
//!
//! HTTP entry point for every client request. POST bodies are JSON packets
//! tagged with `t` and answered with a `{k, r, t}` envelope; GET serves
//! static pages. Joining players get a dedicated WebSocket channel.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::network::admin::{self, AdminCommand, AdminError};
use crate::network::connection::wait_for_shutdown;
use crate::network::pages::serve_page;
use crate::network::roster::{JoinError, JoinPolicy, JoinRequest, Roster};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Env var: control port; player ports follow it.
pub const ENV_BASE_PORT: &str = "TGC_BasePort";
/// Env var: shared admin key. Blank or unset disables admin commands.
pub const ENV_ADMIN_KEY: &str = "TGC_RemoteAdminAuthKey";
/// Env var: exact client version accepted on join.
pub const ENV_ALLOWED_VERSION: &str = "TGC_AllowedClientVersion";
/// Env var: static pages directory.
pub const ENV_PAGES_DIR: &str = "TGC_ServerPagesDir";
/// Env var: roster capacity.
pub const ENV_MAX_PLAYERS: &str = "TGC_MaxPlayers";
/// Env var: address all endpoints bind to.
pub const ENV_BIND_ADDRESS: &str = "TGC_BindAddress";

/// Admin key shipped in the sample environment; refused at startup.
pub const PLACEHOLDER_ADMIN_KEY: &str = "ExamplePassword_CHANGE_ME";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the control and player endpoints bind to.
    pub bind_ip: IpAddr,
    /// Control port. Player channels use the ports above it.
    pub base_port: u16,
    /// Roster capacity.
    pub max_players: usize,
    /// Shared admin key.
    pub admin_key: Option<String>,
    /// Exact client version accepted on join. Any if unset.
    pub allowed_version: Option<String>,
    /// Static pages directory.
    pub pages_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            base_port: 9943,
            max_players: 2,
            admin_key: None,
            allowed_version: None,
            pages_dir: None,
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable did not parse.
    #[error("{var} has invalid value '{value}'")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
    },

    /// The sample admin key was left in place.
    #[error("change the remote admin key from the example value, or remove it to disable remote admin")]
    PlaceholderAdminKey,
}

impl ServerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Create config from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Blank values count as unset.
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let admin_key = get(ENV_ADMIN_KEY);
        if admin_key.as_deref() == Some(PLACEHOLDER_ADMIN_KEY) {
            return Err(ConfigError::PlaceholderAdminKey);
        }

        Ok(Self {
            bind_ip: parse_var(ENV_BIND_ADDRESS, get(ENV_BIND_ADDRESS))?.unwrap_or(defaults.bind_ip),
            base_port: parse_var(ENV_BASE_PORT, get(ENV_BASE_PORT))?.unwrap_or(defaults.base_port),
            max_players: parse_var(ENV_MAX_PLAYERS, get(ENV_MAX_PLAYERS))?
                .unwrap_or(defaults.max_players),
            admin_key,
            allowed_version: get(ENV_ALLOWED_VERSION),
            pages_dir: get(ENV_PAGES_DIR).map(PathBuf::from),
        })
    }

    /// Join policy derived from this config.
    pub fn join_policy(&self) -> JoinPolicy {
        JoinPolicy {
            bind_ip: self.bind_ip,
            allowed_version: self.allowed_version.clone(),
        }
    }
}

fn parse_var<T: std::str::FromStr>(
    var: &'static str,
    raw: Option<String>,
) -> Result<Option<T>, ConfigError> {
    raw.map(|value| {
        value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { var, value })
    })
    .transpose()
}

// =============================================================================
// ERRORS
// =============================================================================

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind or serve.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// Bad configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Request-level failures, reported as `k=false` with the message as `r`.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// Body is not a JSON object.
    #[error("Request body is not a valid JSON object")]
    MalformedBody,

    /// A required field is absent or not a string.
    #[error("Request is missing field '{0}'")]
    MissingField(&'static str),

    /// Top-level `t` not recognized.
    #[error("Unknown packet type '{0}'!")]
    UnknownPacketType(String),

    /// Player `action` not recognized.
    #[error("Unrecognised action: {0}")]
    UnrecognizedAction(String),

    /// Join refused.
    #[error(transparent)]
    Join(#[from] JoinError),

    /// Admin command refused.
    #[error(transparent)]
    Admin(#[from] AdminError),

    /// Response could not be built.
    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// SHARED STATE
// =============================================================================

/// State shared by the dispatcher and scheduled admin actions.
pub struct ServerState {
    /// Configuration read at startup.
    pub config: ServerConfig,
    started_at: Instant,
    in_game: AtomicBool,
    roster: RwLock<Roster>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl ServerState {
    /// Fresh state with an empty roster.
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let roster = Roster::new(config.max_players, config.base_port);
        Self {
            config,
            started_at: Instant::now(),
            in_game: AtomicBool::new(false),
            roster: RwLock::new(roster),
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    /// Time since startup.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Whether a match is in progress.
    pub fn in_game(&self) -> bool {
        self.in_game.load(Ordering::Acquire)
    }

    /// Mark a match as started or finished.
    pub fn set_in_game(&self, in_game: bool) {
        self.in_game.store(in_game, Ordering::Release);
    }

    /// The roster. Joins hold the write lock for the whole admission.
    pub fn roster(&self) -> &RwLock<Roster> {
        &self.roster
    }

    /// Receiver for the process-wide shutdown signal.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Fire the shutdown signal now.
    pub fn request_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Whether shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

// =============================================================================
// RESPONSE ENVELOPE
// =============================================================================

/// `{k, r, t}` wrapper of every POST response.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseEnvelope {
    /// Success flag.
    pub k: bool,
    /// Payload or error message.
    pub r: Value,
    /// When the response was produced.
    pub t: DateTime<Local>,
}

impl ResponseEnvelope {
    /// Wrap a handler result.
    pub fn from_result(result: Result<Value, RequestError>) -> Self {
        let (k, r) = match result {
            Ok(payload) => (true, payload),
            Err(e) => (false, Value::String(e.to_string())),
        };
        Self {
            k,
            r,
            t: Local::now(),
        }
    }
}

// =============================================================================
// PACKET HANDLING
// =============================================================================

fn str_field<'a>(packet: &'a Value, field: &'static str) -> Result<&'a str, RequestError> {
    packet
        .get(field)
        .and_then(Value::as_str)
        .ok_or(RequestError::MissingField(field))
}

/// Handle one decoded POST packet.
pub async fn handle_packet(
    state: &ServerState,
    packet: &Value,
    remote: SocketAddr,
) -> Result<Value, RequestError> {
    match str_field(packet, "t")? {
        "ping" => Ok(Value::String("ack".into())),
        "status" => Ok(status(state).await),
        "admin" => handle_admin(state, packet, remote),
        "player" => handle_player(state, packet, remote).await,
        other => Err(RequestError::UnknownPacketType(other.to_string())),
    }
}

async fn status(state: &ServerState) -> Value {
    let in_game = state.in_game();
    let mut status = json!({
        "inGame": in_game,
        "uptime": state.uptime().as_secs_f64(),
    });
    if !in_game {
        let roster = state.roster().read().await;
        status["currentPlayers"] = json!(roster.len());
        status["maxPlayers"] = json!(roster.max_players());
    }
    status
}

fn handle_admin(
    state: &ServerState,
    packet: &Value,
    remote: SocketAddr,
) -> Result<Value, RequestError> {
    let supplied = packet.get("a").and_then(Value::as_str);
    if let Err(e) = admin::authorize(state.config.admin_key.as_deref(), supplied) {
        match &e {
            AdminError::NotConfigured => {
                error!("Admin command attempted by {} but no admin key is configured", remote)
            }
            _ => warn!("Client at {} failed admin authentication", remote),
        }
        return Err(e.into());
    }

    let command = AdminCommand::from_packet(packet)?;
    error!(
        "{:?} triggered by {} in {} seconds",
        command,
        remote,
        command.delay().as_secs()
    );
    command.schedule(state.shutdown_tx.clone());
    Ok(Value::String(command.acknowledgement()))
}

async fn handle_player(
    state: &ServerState,
    packet: &Value,
    remote: SocketAddr,
) -> Result<Value, RequestError> {
    match str_field(packet, "action")? {
        "join" => {
            let request = JoinRequest::from_packet(packet)?;
            let mut roster = state.roster().write().await;
            let record = roster
                .join(
                    request,
                    remote,
                    &state.config.join_policy(),
                    state.shutdown_signal(),
                )
                .await?;
            serde_json::to_value(record).map_err(|e| RequestError::Internal(e.to_string()))
        }
        "list" => {
            let roster = state.roster().read().await;
            serde_json::to_value(roster.records()).map_err(|e| RequestError::Internal(e.to_string()))
        }
        other => Err(RequestError::UnrecognizedAction(other.to_string())),
    }
}

/// Decode a POST body and handle it.
pub async fn handle_post(
    state: &ServerState,
    body: &[u8],
    remote: SocketAddr,
) -> (StatusCode, ResponseEnvelope) {
    let packet = match serde_json::from_slice::<Value>(body) {
        Ok(packet @ Value::Object(_)) => packet,
        _ => {
            debug!("Malformed request body from {}", remote);
            return (
                StatusCode::BAD_REQUEST,
                ResponseEnvelope::from_result(Err(RequestError::MalformedBody)),
            );
        }
    };
    if let Err(e) = str_field(&packet, "t") {
        debug!("Request without a packet type from {}", remote);
        return (StatusCode::BAD_REQUEST, ResponseEnvelope::from_result(Err(e)));
    }

    let result = handle_packet(state, &packet, remote).await;
    let kind = packet.get("t").unwrap_or(&Value::Null);
    trace!(
        "Request {} from {} processed {}",
        kind,
        remote,
        if result.is_ok() { "successfully" } else { "unsuccessfully" }
    );
    (StatusCode::OK, ResponseEnvelope::from_result(result))
}

async fn dispatch(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Response {
    match method {
        Method::POST => {
            let (status, envelope) = handle_post(&state, &body, remote).await;
            (status, Json(envelope)).into_response()
        }
        Method::GET => serve_page(state.config.pages_dir.as_deref(), uri.path())
            .await
            .into_response(),
        _ => (
            StatusCode::METHOD_NOT_ALLOWED,
            [(header::ALLOW, "GET, POST")],
            "Method not allowed",
        )
            .into_response(),
    }
}

// =============================================================================
// SERVER
// =============================================================================

/// The game server.
pub struct GameServer {
    state: Arc<ServerState>,
}

impl GameServer {
    /// Create a new game server.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            state: Arc::new(ServerState::new(config)),
        }
    }

    /// Shared state handle.
    pub fn state(&self) -> Arc<ServerState> {
        self.state.clone()
    }

    /// HTTP routes. Every path and method lands in the dispatcher.
    pub fn router(&self) -> Router {
        Router::new().fallback(dispatch).with_state(self.state.clone())
    }

    /// Bind the control port and serve until shutdown.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), GameServerError> {
        let addr = SocketAddr::new(self.state.config.bind_ip, self.state.config.base_port);
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GameServerError> {
        info!(
            "Control server listening on {} (base port {})",
            listener.local_addr()?,
            self.state.config.base_port
        );

        let mut shutdown = self.state.shutdown_signal();
        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { wait_for_shutdown(&mut shutdown).await })
        .await?;

        info!("Control server stopped");
        Ok(())
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        self.state.request_shutdown();
    }

    /// Number of joined players.
    pub async fn player_count(&self) -> usize {
        self.state.roster().read().await.len()
    }
}
