#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use futures_util::StreamExt;
use messenger_common::{SnowflakeGenerator, UserId};
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite::{self, client::IntoClientRequest};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use chat_gateway::config::{Config, GatewaySettings};
use chat_gateway::db::store::{ChatKind, MemoryChatStore};
use chat_gateway::gateway::relay::Relay;
use chat_gateway::AppState;

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const TEST_JWT_SECRET: &str = "test-secret-that-is-at-least-32-bytes-long";

/// Group chat with members 1, 2 and 3.
pub const GROUP_CHAT: i64 = 7;
/// Private chat between users 4 and 5.
pub const PRIVATE_CHAT: i64 = 9;

pub fn test_config(instance_id: &str) -> Config {
    Config {
        database_url: None,
        jwt_secret: TEST_JWT_SECRET.to_string(),
        encryption_key: base64::engine::general_purpose::STANDARD.encode([7u8; 32]),
        port: 0,
        redis_enabled: false,
        redis_url: String::new(),
        instance_id: instance_id.to_string(),
        gateway: GatewaySettings::default(),
    }
}

/// In-memory store seeded with users 1..=5 and the two fixture chats.
pub fn seeded_store() -> Arc<MemoryChatStore> {
    let store = MemoryChatStore::new(Arc::new(SnowflakeGenerator::new(1)));
    for (id, name) in [(1, "alice"), (2, "bob"), (3, "carol"), (4, "dave"), (5, "erin")] {
        store.insert_user(id, name);
    }
    store.insert_chat(GROUP_CHAT, ChatKind::Group, &[1, 2, 3]);
    store.insert_chat(PRIVATE_CHAT, ChatKind::Private, &[4, 5]);
    Arc::new(store)
}

/// Test app state backed by the in-memory store.
pub fn test_state(relay: Option<Arc<Relay>>) -> (AppState, Arc<MemoryChatStore>) {
    let store = seeded_store();
    let state = AppState::new(test_config("inst_test"), store.clone(), relay)
        .expect("test encryption key is valid");
    (state, store)
}

/// Start an actual TCP server in the background.
pub async fn start_server(state: AppState) -> SocketAddr {
    let app = chat_gateway::routes::router().with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

pub fn mint_token(state: &AppState, user_id: UserId) -> String {
    state.tokens.mint(user_id, 300).expect("mint test token")
}

/// Connect with a `?token=` credential and consume the greeting frame.
pub async fn connect(addr: SocketAddr, token: &str) -> WsClient {
    let url = format!("ws://{addr}/ws?token={token}");
    let (mut ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .expect("ws connect");

    let greeting = next_event(&mut ws).await;
    assert_eq!(greeting["type"], "debug", "first frame should be the greeting");
    ws
}

/// Connect with a custom handshake header instead of the query string.
pub async fn connect_with_header(
    addr: SocketAddr,
    name: &'static str,
    value: &str,
) -> Result<(WsClient, tungstenite::handshake::client::Response), tungstenite::Error> {
    let mut request = format!("ws://{addr}/ws").into_client_request()?;
    request
        .headers_mut()
        .insert(name, value.parse().expect("header value"));
    tokio_tungstenite::connect_async(request).await
}

/// Next JSON event, skipping control frames.
pub async fn next_event(ws: &mut WsClient) -> serde_json::Value {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for event")
            .expect("stream ended")
            .expect("ws read error");

        match msg {
            tungstenite::Message::Text(text) => {
                return serde_json::from_str(&text).expect("parse event");
            }
            tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) => continue,
            other => panic!("expected text frame, got: {other:?}"),
        }
    }
}

/// Assert that no data frame arrives within `wait`.
pub async fn expect_silence(ws: &mut WsClient, wait: Duration) {
    let deadline = time::Instant::now() + wait;
    loop {
        match time::timeout_at(deadline, ws.next()).await {
            Err(_) => return,
            Ok(Some(Ok(tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_)))) => continue,
            Ok(other) => panic!("expected silence, got: {other:?}"),
        }
    }
}

/// Wait until the server closes the connection.
pub async fn expect_closed(ws: &mut WsClient) {
    loop {
        match time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for close")
        {
            None | Some(Err(_)) | Some(Ok(tungstenite::Message::Close(_))) => return,
            Some(Ok(tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_))) => continue,
            Some(Ok(other)) => panic!("expected close, got: {other:?}"),
        }
    }
}
