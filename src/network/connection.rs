//! Player Connection Engine
//!
//! One dedicated WebSocket endpoint per joined player. The engine binds its
//! port at construction, waits for the client to upgrade, runs the
//! challenge/response handshake and then serves the authenticated
//! request/response loop alongside an outbound sender task.
//!
//! ```text
//! AwaitingSocket ──upgrade──▶ Handshaking ──valid signature──▶ Authenticated
//!        │                         │                                │
//!        └──shutdown───────────────┴──5 fails / close / shutdown────┴──▶ Closed
//! ```

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::core::token::{handshake_signature, Token, HANDSHAKE_TOKEN_LENGTH};
use crate::network::framing::{unframe, Received};
use crate::network::protocol::{
    ClientEnvelope, MessageKind, PacketResponse, ProtocolError, ServerMessage,
    MSG_HANDSHAKE_DONE, MSG_SERVER_ONLY, MSG_UNPROCESSABLE,
};

/// Consecutive handshake failures tolerated before the channel is closed.
pub const MAX_HANDSHAKE_FAILS: u32 = 5;

/// How long an accepted socket has to complete the WebSocket upgrade.
pub const UPGRADE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed `accept()` before listening again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

type WsStream = WebSocketStream<TcpStream>;
type SharedSink = Arc<Mutex<SplitSink<WsStream, Message>>>;

/// Lifecycle phase of a player channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Endpoint bound, no client attached yet.
    AwaitingSocket,
    /// Client attached, challenge outstanding.
    Handshaking,
    /// Signature verified, exchange loop running.
    Authenticated,
    /// Terminal.
    Closed,
}

/// The player a channel belongs to.
#[derive(Debug, Clone)]
pub struct PlayerIdentity {
    /// Display name.
    pub name: String,
    /// Session identity the signature is derived from.
    pub guid: Uuid,
}

/// Connection errors.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Could not open the player endpoint.
    #[error("Failed to bind port {port}: {source}")]
    Bind {
        /// Requested port.
        port: u16,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Channel is closed; nothing more can be sent.
    #[error("Connection closed")]
    Closed,
}

/// Why a handshake reply was not accepted.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeFailure {
    /// Reply did not parse as an envelope.
    #[error("malformed reply: {0}")]
    Malformed(#[from] ProtocolError),

    /// Reply was some other kind.
    #[error("expected RespondToHandshake, got {0}")]
    UnexpectedKind(MessageKind),

    /// Signature did not match.
    #[error("invalid signature")]
    BadSignature,
}

/// Check a handshake reply against the expected signature.
pub fn verify_handshake_reply(text: &str, expected: &str) -> Result<(), HandshakeFailure> {
    let envelope = ClientEnvelope::parse(text)?;
    if envelope.kind() != MessageKind::RespondToHandshake {
        return Err(HandshakeFailure::UnexpectedKind(envelope.kind()));
    }
    match envelope.signature() {
        Some(sig) if sig.as_bytes() == expected.as_bytes() => Ok(()),
        _ => Err(HandshakeFailure::BadSignature),
    }
}

/// Post-handshake dispatch table. One reply per inbound frame.
pub fn handle_packet(envelope: &ClientEnvelope) -> PacketResponse {
    let kind = envelope.kind();
    if kind.is_server_only() {
        return PacketResponse::error(MSG_SERVER_ONLY);
    }
    match kind {
        MessageKind::RespondToHandshake => PacketResponse::error(MSG_HANDSHAKE_DONE),
        MessageKind::Ping => {
            let mut data = Map::new();
            data.insert("acknowledged".into(), Value::Bool(true));
            PacketResponse::ok(MessageKind::PingResponse, data)
        }
        _ => PacketResponse::error(MSG_UNPROCESSABLE),
    }
}

/// Resolve once shutdown has been requested. Never resolves if the signal
/// source is dropped without firing.
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let fired = shutdown.wait_for(|stop| *stop).await.is_ok();
    if !fired {
        std::future::pending::<()>().await;
    }
}

/// Handle to a player's channel.
///
/// Owned by the player's record; dropping it tears the channel down.
pub struct PlayerConnection {
    port: u16,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    phase: watch::Receiver<ConnectionPhase>,
    task: JoinHandle<()>,
}

impl PlayerConnection {
    /// Bind the player's endpoint and start waiting for the client.
    pub async fn open(
        bind_ip: IpAddr,
        port: u16,
        player: PlayerIdentity,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, ConnectionError> {
        let token = Token::generate(HANDSHAKE_TOKEN_LENGTH);
        Self::open_with_token(bind_ip, port, player, token, shutdown).await
    }

    /// [`open`](Self::open) with a caller-chosen challenge token.
    pub async fn open_with_token(
        bind_ip: IpAddr,
        port: u16,
        player: PlayerIdentity,
        token: Token,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, ConnectionError> {
        let bind_err = |source| ConnectionError::Bind { port, source };
        let listener = TcpListener::bind(SocketAddr::new(bind_ip, port))
            .await
            .map_err(bind_err)?;
        let port = listener.local_addr().map_err(bind_err)?.port();
        info!("Opened channel for player {} on port {}", player.name, port);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (phase_tx, phase_rx) = watch::channel(ConnectionPhase::AwaitingSocket);

        let engine = Engine {
            player,
            port,
            token,
            phase: phase_tx,
            shutdown,
        };
        let task = tokio::spawn(engine.run(listener, outbound_rx));

        Ok(Self {
            port,
            outbound: outbound_tx,
            phase: phase_rx,
            task,
        })
    }

    /// Port the endpoint is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Current phase.
    pub fn phase(&self) -> ConnectionPhase {
        *self.phase.borrow()
    }

    /// Watch phase transitions.
    pub fn subscribe_phase(&self) -> watch::Receiver<ConnectionPhase> {
        self.phase.clone()
    }

    /// Wait until the channel reaches [`ConnectionPhase::Closed`].
    pub async fn closed(&self) {
        let mut phase = self.phase.clone();
        let _ = phase.wait_for(|p| *p == ConnectionPhase::Closed).await;
    }

    /// Queue a message for the sender task.
    ///
    /// Safe to call from any number of tasks. Messages queued before the
    /// handshake completes are delivered after `ConfirmHandshake`.
    pub fn enqueue(&self, message: ServerMessage) -> Result<(), ConnectionError> {
        if self.phase() == ConnectionPhase::Closed {
            return Err(ConnectionError::Closed);
        }
        self.outbound
            .send(message)
            .map_err(|_| ConnectionError::Closed)
    }
}

impl Drop for PlayerConnection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for PlayerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayerConnection")
            .field("port", &self.port)
            .field("phase", &self.phase())
            .finish()
    }
}

// =============================================================================
// ENGINE
// =============================================================================

enum Inbound {
    Payload(String),
    Closed,
    Shutdown,
}

enum HandshakeOutcome {
    Authenticated,
    Exhausted,
    Aborted,
}

struct Engine {
    player: PlayerIdentity,
    port: u16,
    token: Token,
    phase: watch::Sender<ConnectionPhase>,
    shutdown: watch::Receiver<bool>,
}

impl Engine {
    async fn run(mut self, listener: TcpListener, outbound: mpsc::UnboundedReceiver<ServerMessage>) {
        let Some(ws) = self.accept(&listener).await else {
            debug!("Channel on port {} shut down before a client attached", self.port);
            self.phase.send_replace(ConnectionPhase::Closed);
            return;
        };
        self.phase.send_replace(ConnectionPhase::Handshaking);

        let (sink, mut stream) = ws.split();
        let sink: SharedSink = Arc::new(Mutex::new(sink));

        match self.handshake(&sink, &mut stream).await {
            Ok(HandshakeOutcome::Authenticated) => {}
            Ok(HandshakeOutcome::Exhausted) => {
                error!(
                    "Player {} experienced {} handshake fails, disconnecting",
                    self.player.name, MAX_HANDSHAKE_FAILS
                );
                self.phase.send_replace(ConnectionPhase::Closed);
                close(&sink, CloseCode::Protocol, "Too many handshake fails!").await;
                return;
            }
            Ok(HandshakeOutcome::Aborted) => {
                self.phase.send_replace(ConnectionPhase::Closed);
                close(&sink, CloseCode::Away, "Server shutting down").await;
                return;
            }
            Err(e) => {
                warn!("Handshake with player {} failed: {}", self.player.name, e);
                self.phase.send_replace(ConnectionPhase::Closed);
                return;
            }
        }

        self.phase.send_replace(ConnectionPhase::Authenticated);
        let sender_task = tokio::spawn(run_sender(
            sink.clone(),
            outbound,
            self.phase.subscribe(),
        ));

        let shutting_down = self.exchange(&sink, &mut stream).await;

        self.phase.send_replace(ConnectionPhase::Closed);
        let _ = sender_task.await;
        if shutting_down {
            close(&sink, CloseCode::Away, "Server shutting down").await;
        } else {
            close(&sink, CloseCode::Normal, "").await;
        }
        info!("Channel for player {} on port {} closed", self.player.name, self.port);
    }

    /// Accept loop. Upgrades run concurrently so a stalled socket cannot
    /// hold the port; the first one to succeed wins and the rest are dropped.
    async fn accept(&mut self, listener: &TcpListener) -> Option<WsStream> {
        let mut upgrades = JoinSet::new();
        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, addr)) => {
                        upgrades.spawn(async move {
                            (addr, tokio::time::timeout(UPGRADE_TIMEOUT, accept_async(stream)).await)
                        });
                    }
                    Err(e) => {
                        error!("Accept error on port {}: {}", self.port, e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
                Some(joined) = upgrades.join_next(), if !upgrades.is_empty() => match joined {
                    Ok((addr, Ok(Ok(ws)))) => {
                        debug!("WebSocket on port {} established with {}", self.port, addr);
                        return Some(ws);
                    }
                    Ok((addr, Ok(Err(e)))) => {
                        trace!(
                            "Non-WebSocket request from {} on port {} ignored: {}",
                            addr, self.port, e
                        );
                    }
                    Ok((addr, Err(_))) => {
                        debug!("Upgrade from {} on port {} timed out", addr, self.port);
                    }
                    Err(e) => warn!("Upgrade task on port {} failed: {}", self.port, e),
                },
                _ = wait_for_shutdown(&mut self.shutdown) => return None,
            }
        }
    }

    async fn handshake(
        &mut self,
        sink: &SharedSink,
        stream: &mut SplitStream<WsStream>,
    ) -> Result<HandshakeOutcome, ConnectionError> {
        let expected = handshake_signature(&self.player.guid.to_string(), self.token.value());
        let challenge = ServerMessage::StartHandshake(self.token.clone()).to_json();
        let mut fails = 0;

        loop {
            if fails >= MAX_HANDSHAKE_FAILS {
                return Ok(HandshakeOutcome::Exhausted);
            }

            trace!(
                "Handshake attempt {} for player {}",
                fails + 1,
                self.player.name
            );
            send(sink, challenge.clone()).await?;

            let text = match self.receive(stream).await {
                Inbound::Payload(text) => text,
                Inbound::Closed | Inbound::Shutdown => return Ok(HandshakeOutcome::Aborted),
            };

            match verify_handshake_reply(&text, &expected) {
                Ok(()) => {
                    info!("Player {} completed handshake", self.player.name);
                    send(sink, ServerMessage::ConfirmHandshake.to_json()).await?;
                    return Ok(HandshakeOutcome::Authenticated);
                }
                Err(reason) => {
                    fails += 1;
                    warn!(
                        "Handshake attempt {} from player {} rejected: {}",
                        fails, self.player.name, reason
                    );
                }
            }
        }
    }

    /// Authenticated loop. Exactly one reply per inbound frame, in order.
    ///
    /// Returns true if it ended because of shutdown.
    async fn exchange(&mut self, sink: &SharedSink, stream: &mut SplitStream<WsStream>) -> bool {
        loop {
            let text = match self.receive(stream).await {
                Inbound::Payload(text) => text,
                Inbound::Closed => return false,
                Inbound::Shutdown => return true,
            };

            let response = match ClientEnvelope::parse(&text) {
                Ok(envelope) => {
                    trace!(
                        "Handling {} from player {}",
                        envelope.kind(),
                        self.player.name
                    );
                    handle_packet(&envelope)
                }
                Err(e) => {
                    warn!("Bad packet from player {}: {}", self.player.name, e);
                    PacketResponse::error(MSG_UNPROCESSABLE)
                }
            };

            let json = match response.to_json() {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to serialize response: {}", e);
                    continue;
                }
            };
            if let Err(e) = send(sink, json).await {
                warn!("Send to player {} failed: {}", self.player.name, e);
                return false;
            }
        }
    }

    /// Read the next protocol payload, skipping control frames.
    async fn receive(&mut self, stream: &mut SplitStream<WsStream>) -> Inbound {
        loop {
            let next = tokio::select! {
                next = stream.next() => next,
                _ = wait_for_shutdown(&mut self.shutdown) => return Inbound::Shutdown,
            };

            match next {
                Some(Ok(message)) => match unframe(message) {
                    Received::Text(text) => {
                        #[cfg(feature = "debug-tracing")]
                        trace!("Player {} (port {}) sent: {}", self.player.name, self.port, text);
                        return Inbound::Payload(text);
                    }
                    received @ Received::Binary => {
                        error!(
                            "Binary message received from player {} (port {}), unsupported",
                            self.player.name, self.port
                        );
                        return Inbound::Payload(received.into_text());
                    }
                    Received::Close => {
                        warn!("Player {} sent a close request", self.player.name);
                        self.phase.send_replace(ConnectionPhase::Closed);
                        return Inbound::Closed;
                    }
                    Received::Control => continue,
                },
                Some(Err(e)) => {
                    warn!("WebSocket error for player {}: {}", self.player.name, e);
                    return Inbound::Closed;
                }
                None => return Inbound::Closed,
            }
        }
    }
}

/// Drain the outbound queue until the channel closes.
async fn run_sender(
    sink: SharedSink,
    mut outbound: mpsc::UnboundedReceiver<ServerMessage>,
    mut phase: watch::Receiver<ConnectionPhase>,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = phase.wait_for(|p| *p == ConnectionPhase::Closed) => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        if let Err(e) = send(&sink, message.to_json()).await {
            debug!("Sender stopped: {}", e);
            break;
        }
    }
}

async fn send(sink: &SharedSink, text: String) -> Result<(), ConnectionError> {
    sink.lock().await.send(Message::Text(text)).await?;
    Ok(())
}

async fn close(sink: &SharedSink, code: CloseCode, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = sink.lock().await.send(Message::Close(Some(frame))).await;
}

// =============================================================================
// TESTS
// =============================================================================
