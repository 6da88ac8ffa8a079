//! End-to-end session flow over loopback: HTTP join, channel handshake,
//! ping, then shutdown.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use tgc_server::network::server::{GameServerError, ServerState};
use tgc_server::{handshake_signature, GameServer, ServerConfig};

struct Running {
    port: u16,
    state: Arc<ServerState>,
    task: JoinHandle<Result<(), GameServerError>>,
}

async fn start_server(max_players: usize) -> Running {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = GameServer::new(ServerConfig {
        bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        base_port: port,
        max_players,
        allowed_version: Some("1.0".into()),
        ..Default::default()
    });
    let state = server.state();
    let task = tokio::spawn(async move { server.serve(listener).await });
    Running { port, state, task }
}

/// Minimal HTTP/1.1 exchange. Returns the status line and body.
async fn http(port: u16, method: &str, path: &str, body: &str) -> (String, String) {
    let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
    let request = format!(
        "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut raw))
        .await
        .expect("timed out waiting for HTTP response")
        .unwrap();
    let text = String::from_utf8(raw).unwrap();
    let (head, body) = text.split_once("\r\n\r\n").unwrap();
    (head.to_string(), body.to_string())
}

async fn post(port: u16, packet: Value) -> Value {
    let (head, body) = http(port, "POST", "/", &packet.to_string()).await;
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected head: {}", head);
    serde_json::from_str(&body).unwrap()
}

async fn next_json<S>(ws: &mut S) -> Value
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("timed out waiting for channel")
        .expect("channel ended")
        .unwrap();
    match msg {
        Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected text frame, got {:?}", other),
    }
}

#[tokio::test]
async fn test_join_handshake_ping_shutdown() {
    let server = start_server(2).await;

    let joined = post(
        server.port,
        json!({ "t": "player", "action": "join", "name": "Ada", "clientVersion": "1.0" }),
    )
    .await;
    assert_eq!(joined["k"], true);
    assert_eq!(joined["r"]["name"], "Ada");
    assert_eq!(joined["r"]["socketPort"], server.port + 1);
    assert!(joined["t"].is_string());

    let guid = joined["r"]["guid"].as_str().unwrap().to_string();
    let channel_port = joined["r"]["socketPort"].as_u64().unwrap();

    let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{}/", channel_port))
        .await
        .unwrap();
    let challenge = next_json(&mut ws).await;
    assert_eq!(challenge["t"], "StartHandshake");
    let token = challenge["token"]["value"].as_str().unwrap();
    assert_eq!(challenge["token"]["length"], 32);

    let reply = json!({ "t": "RespondToHandshake", "s": handshake_signature(&guid, token) });
    ws.send(Message::Text(reply.to_string())).await.unwrap();
    assert_eq!(next_json(&mut ws).await, json!({ "t": "ConfirmHandshake" }));

    ws.send(Message::Text(r#"{"t":"Ping"}"#.into())).await.unwrap();
    let pong = next_json(&mut ws).await;
    assert_eq!(pong["ok"], true);
    assert_eq!(pong["t"], "PingResponse");

    let status = post(server.port, json!({ "t": "status" })).await;
    assert_eq!(status["r"]["currentPlayers"], 1);
    assert_eq!(status["r"]["maxPlayers"], 2);

    server.state.request_shutdown();
    tokio::time::timeout(Duration::from_secs(5), server.task)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();

    // The channel winds down with the server.
    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(ended.is_ok());
}

#[tokio::test]
async fn test_duplicate_and_capacity_rejections() {
    let server = start_server(1).await;

    let join = |name: &str| json!({ "t": "player", "action": "join", "name": name, "clientVersion": "1.0" });

    assert_eq!(post(server.port, join("Ada")).await["k"], true);

    let dup = post(server.port, join("Ada")).await;
    assert_eq!(dup["k"], false);

    let full = post(server.port, join("Bob")).await;
    assert_eq!(full["k"], false);
    assert_eq!(full["r"], "The server is full");

    let players = post(server.port, json!({ "t": "player", "action": "list" })).await;
    assert_eq!(players["r"].as_array().unwrap().len(), 1);

    server.state.request_shutdown();
}

#[tokio::test]
async fn test_non_post_requests() {
    let server = start_server(2).await;

    let (head, _) = http(server.port, "PUT", "/", "").await;
    assert!(head.starts_with("HTTP/1.1 405"), "unexpected head: {}", head);
    assert!(head.to_ascii_lowercase().contains("allow: get, post"));

    // No pages directory configured.
    let (head, _) = http(server.port, "GET", "/", "").await;
    assert!(head.starts_with("HTTP/1.1 500"), "unexpected head: {}", head);

    let (head, body) = http(server.port, "POST", "/", "{oops").await;
    assert!(head.starts_with("HTTP/1.1 400"), "unexpected head: {}", head);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["k"], false);

    server.state.request_shutdown();
}
