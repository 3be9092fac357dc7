mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use futures_util::SinkExt;
use http::{Request, StatusCode};
use tokio::time;
use tokio_tungstenite::tungstenite;
use tower::ServiceExt;

use chat_gateway::gateway::keepalive::KeepalivePolicy;
use chat_gateway::gateway::relay::{MemoryBroker, PubSubBroker, Relay};
use chat_gateway::AppState;

use common::{WsClient, GROUP_CHAT, PRIVATE_CHAT};

async fn send_json(ws: &mut WsClient, value: serde_json::Value) {
    ws.send(tungstenite::Message::Text(value.to_string().into()))
        .await
        .expect("send frame");
}

fn chat_message(chat_id: i64, content: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "message",
        "payload": { "chatId": chat_id, "content": content }
    })
}

// ---------------------------------------------------------------------------
// Handshake and authentication
// ---------------------------------------------------------------------------

#[tokio::test]
async fn greeting_carries_user_and_connection() {
    let (state, _store) = common::test_state(None);
    let token = common::mint_token(&state, 2);
    let addr = common::start_server(state).await;

    let url = format!("ws://{addr}/ws?token={token}");
    let (mut ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .expect("ws connect");

    let greeting = common::next_event(&mut ws).await;
    assert_eq!(greeting["type"], "debug");
    assert_eq!(greeting["payload"]["user_id"], 2);
    assert!(greeting["payload"]["message_data"]["connection_id"]
        .as_str()
        .unwrap()
        .starts_with("conn_"));
}

#[tokio::test]
async fn upgrade_without_credentials_is_rejected_with_bare_401() {
    let (state, _store) = common::test_state(None);
    let app = chat_gateway::routes::router().with_state(state);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/ws")
                .header("connection", "upgrade")
                .header("upgrade", "websocket")
                .header("sec-websocket-version", "13")
                .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert!(body.is_empty());
}

#[tokio::test]
async fn invalid_token_fails_the_handshake() {
    let (state, _store) = common::test_state(None);
    let addr = common::start_server(state).await;

    let url = format!("ws://{addr}/ws?token=not-a-jwt");
    match tokio_tungstenite::connect_async(url).await {
        Err(tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
        other => panic!("expected HTTP 401, got: {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn bearer_header_authenticates() {
    let (state, _store) = common::test_state(None);
    let token = common::mint_token(&state, 3);
    let addr = common::start_server(state).await;

    let (mut ws, _) =
        common::connect_with_header(addr, "authorization", &format!("Bearer {token}"))
            .await
            .expect("bearer handshake");

    let greeting = common::next_event(&mut ws).await;
    assert_eq!(greeting["payload"]["user_id"], 3);
}

#[tokio::test]
async fn cookie_authenticates() {
    let (state, _store) = common::test_state(None);
    let token = common::mint_token(&state, 1);
    let addr = common::start_server(state).await;

    let (mut ws, _) = common::connect_with_header(addr, "cookie", &format!("token={token}"))
        .await
        .expect("cookie handshake");

    let greeting = common::next_event(&mut ws).await;
    assert_eq!(greeting["payload"]["user_id"], 1);
}

#[tokio::test]
async fn subprotocol_token_is_echoed_back() {
    let (state, _store) = common::test_state(None);
    let token = common::mint_token(&state, 4);
    let addr = common::start_server(state).await;

    let protocol = format!("token={token}");
    let (mut ws, response) =
        common::connect_with_header(addr, "sec-websocket-protocol", &protocol)
            .await
            .expect("subprotocol handshake");

    let selected = response
        .headers()
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok());
    assert_eq!(selected, Some(protocol.as_str()));

    let greeting = common::next_event(&mut ws).await;
    assert_eq!(greeting["payload"]["user_id"], 4);
}

// ---------------------------------------------------------------------------
// Inbound frames and fan-out
// ---------------------------------------------------------------------------

#[tokio::test]
async fn message_reaches_members_and_echoes_to_author() {
    let (state, store) = common::test_state(None);
    let (t1, t2, t3) = (
        common::mint_token(&state, 1),
        common::mint_token(&state, 2),
        common::mint_token(&state, 3),
    );
    let addr = common::start_server(state).await;

    let mut alice = common::connect(addr, &t1).await;
    let mut bob = common::connect(addr, &t2).await;
    let mut carol = common::connect(addr, &t3).await;

    send_json(&mut alice, chat_message(GROUP_CHAT, "hello")).await;

    let echo = common::next_event(&mut alice).await;
    assert_eq!(echo["type"], "message");
    assert_eq!(echo["payload"]["content"], "hello");

    for ws in [&mut bob, &mut carol] {
        let event = common::next_event(ws).await;
        assert_eq!(event["type"], "message");
        assert_eq!(event["payload"]["chat_id"], GROUP_CHAT);
        assert_eq!(event["payload"]["user_id"], 1);
        assert_eq!(event["payload"]["content"], "hello");
        assert_eq!(event["payload"]["user"]["username"], "alice");
        assert_eq!(event["payload"]["id"], echo["payload"]["id"]);
    }

    // The author gets the echo only, never a second fan-out copy.
    common::expect_silence(&mut alice, Duration::from_millis(200)).await;
    assert_eq!(store.message_count(GROUP_CHAT), 1);
}

#[tokio::test]
async fn unknown_type_is_reported_and_connection_survives() {
    let (state, _store) = common::test_state(None);
    let (t1, t2) = (common::mint_token(&state, 1), common::mint_token(&state, 2));
    let addr = common::start_server(state).await;

    let mut alice = common::connect(addr, &t1).await;
    let mut bob = common::connect(addr, &t2).await;

    send_json(
        &mut alice,
        serde_json::json!({ "type": "bogus", "payload": {} }),
    )
    .await;

    let error = common::next_event(&mut alice).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["payload"]["code"], 400);
    assert_eq!(error["payload"]["message"], "unknown message type: bogus");

    send_json(
        &mut alice,
        serde_json::json!({
            "type": "typing",
            "payload": { "chatId": GROUP_CHAT, "status": true }
        }),
    )
    .await;

    let typing = common::next_event(&mut bob).await;
    assert_eq!(typing["type"], "typing");
    assert_eq!(typing["payload"]["user_id"], 1);
    assert_eq!(typing["payload"]["status"], true);
}

#[tokio::test]
async fn non_member_is_refused() {
    let (state, store) = common::test_state(None);
    let token = common::mint_token(&state, 4);
    let addr = common::start_server(state).await;

    let mut dave = common::connect(addr, &token).await;
    send_json(&mut dave, chat_message(GROUP_CHAT, "let me in")).await;

    let error = common::next_event(&mut dave).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["payload"]["code"], 403);
    assert_eq!(store.message_count(GROUP_CHAT), 0);
}

#[tokio::test]
async fn undecodable_frame_closes_connection() {
    let (state, _store) = common::test_state(None);
    let token = common::mint_token(&state, 1);
    let registry = state.registry.clone();
    let addr = common::start_server(state).await;

    let mut alice = common::connect(addr, &token).await;
    alice
        .send(tungstenite::Message::Text("{not json".to_string().into()))
        .await
        .unwrap();

    common::expect_closed(&mut alice).await;

    // Unregistration follows the socket teardown.
    for _ in 0..50 {
        if registry.is_empty() {
            break;
        }
        time::sleep(Duration::from_millis(20)).await;
    }
    assert!(registry.is_empty());
}

#[tokio::test]
async fn read_receipt_is_persisted_and_broadcast() {
    let (state, store) = common::test_state(None);
    let (t4, t5) = (common::mint_token(&state, 4), common::mint_token(&state, 5));
    let addr = common::start_server(state).await;

    let mut dave = common::connect(addr, &t4).await;
    let mut erin = common::connect(addr, &t5).await;

    send_json(&mut dave, chat_message(PRIVATE_CHAT, "ping")).await;
    let echo = common::next_event(&mut dave).await;
    let message_id = echo["payload"]["id"].as_i64().unwrap();
    common::next_event(&mut erin).await;

    send_json(
        &mut erin,
        serde_json::json!({ "type": "read", "payload": { "messageId": message_id } }),
    )
    .await;

    let receipt = common::next_event(&mut dave).await;
    assert_eq!(receipt["type"], "read");
    assert_eq!(receipt["payload"]["message_id"], message_id);
    assert_eq!(receipt["payload"]["user_id"], 5);
    assert_eq!(receipt["payload"]["chat_id"], PRIVATE_CHAT);
    assert_eq!(store.readers_of(message_id), vec![5]);
}

// ---------------------------------------------------------------------------
// Session lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn second_connection_replaces_the_first() {
    let (state, _store) = common::test_state(None);
    let (t1, t2) = (common::mint_token(&state, 1), common::mint_token(&state, 2));
    let registry = state.registry.clone();
    let addr = common::start_server(state).await;

    let mut first = common::connect(addr, &t1).await;
    let mut second = common::connect(addr, &t1).await;

    common::expect_closed(&mut first).await;
    assert_eq!(registry.len(), 1);

    // The replacement is the live session.
    let mut bob = common::connect(addr, &t2).await;
    send_json(&mut bob, chat_message(GROUP_CHAT, "still there?")).await;
    common::next_event(&mut bob).await;

    let event = common::next_event(&mut second).await;
    assert_eq!(event["payload"]["content"], "still there?");
}

#[tokio::test]
async fn silent_peer_is_dropped_after_idle_window() {
    let mut config = common::test_config("inst_test");
    config.gateway.keepalive =
        KeepalivePolicy::from_idle_window(Duration::from_millis(300), Duration::from_secs(1));
    let state = AppState::new(config, common::seeded_store(), None)
        .expect("test encryption key is valid");
    let token = common::mint_token(&state, 1);
    let registry = state.registry.clone();
    let addr = common::start_server(state).await;

    // Never polled again, so server pings go unanswered.
    let _alice = common::connect(addr, &token).await;
    assert_eq!(registry.len(), 1);

    for _ in 0..100 {
        if registry.is_empty() {
            break;
        }
        time::sleep(Duration::from_millis(30)).await;
    }
    assert!(registry.is_empty(), "idle session should have been dropped");
}

#[tokio::test]
async fn offline_members_are_skipped() {
    let (state, _store) = common::test_state(None);
    let (t1, t2) = (common::mint_token(&state, 1), common::mint_token(&state, 2));
    let addr = common::start_server(state).await;

    // User 3 never connects.
    let mut alice = common::connect(addr, &t1).await;
    let mut bob = common::connect(addr, &t2).await;

    send_json(&mut alice, chat_message(GROUP_CHAT, "anyone?")).await;
    common::next_event(&mut alice).await;

    let event = common::next_event(&mut bob).await;
    assert_eq!(event["payload"]["content"], "anyone?");
}

// ---------------------------------------------------------------------------
// HTTP surface
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_reports_connections() {
    let (state, _store) = common::test_state(None);
    let token = common::mint_token(&state, 1);
    let addr = common::start_server(state.clone()).await;
    let _alice = common::connect(addr, &token).await;

    let app = chat_gateway::routes::router().with_state(state);
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["connections"], 1);
    assert_eq!(json["relay"], false);
}

#[tokio::test]
async fn stored_message_dispatch_requires_author() {
    let (state, _store) = common::test_state(None);
    let (t1, t2) = (common::mint_token(&state, 1), common::mint_token(&state, 2));
    let addr = common::start_server(state.clone()).await;

    let mut alice = common::connect(addr, &t1).await;
    let mut bob = common::connect(addr, &t2).await;
    send_json(&mut alice, chat_message(GROUP_CHAT, "from upload")).await;
    let echo = common::next_event(&mut alice).await;
    common::next_event(&mut bob).await;
    let message_id = echo["payload"]["id"].as_i64().unwrap();

    let dispatch = |token: &str| {
        Request::builder()
            .method("POST")
            .uri(format!("/api/v1/messages/{message_id}/dispatch"))
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap()
    };
    let app = chat_gateway::routes::router().with_state(state);

    let response = app.clone().oneshot(dispatch(&t2)).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app.oneshot(dispatch(&t1)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let report: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(report["delivered"], 1);
    assert_eq!(report["offline"], 1);

    let event = common::next_event(&mut bob).await;
    assert_eq!(event["payload"]["content"], "from upload");
}

// ---------------------------------------------------------------------------
// Cross-instance relay
// ---------------------------------------------------------------------------

async fn relayed_instance(broker: &Arc<MemoryBroker>, instance_id: &str) -> AppState {
    let shared: Arc<dyn PubSubBroker> = broker.clone();
    let relay = Arc::new(Relay::new(shared, instance_id));
    let store = common::seeded_store();
    let state = AppState::new(common::test_config(instance_id), store, Some(relay.clone()))
        .expect("test encryption key is valid");
    relay.spawn_subscriber(state.dispatcher.clone());
    state
}

#[tokio::test]
async fn relay_delivers_across_instances_once() {
    let broker = Arc::new(MemoryBroker::new());
    let a = relayed_instance(&broker, "inst_a").await;
    let b = relayed_instance(&broker, "inst_b").await;

    for _ in 0..100 {
        if broker.subscriber_count() >= 2 {
            break;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(broker.subscriber_count(), 2);

    let (t1, t2, t3) = (
        common::mint_token(&a, 1),
        common::mint_token(&b, 2),
        common::mint_token(&a, 3),
    );
    let addr_a = common::start_server(a).await;
    let addr_b = common::start_server(b).await;

    let mut alice = common::connect(addr_a, &t1).await;
    let mut carol = common::connect(addr_a, &t3).await;
    let mut bob = common::connect(addr_b, &t2).await;

    send_json(&mut alice, chat_message(GROUP_CHAT, "across")).await;
    common::next_event(&mut alice).await;

    let remote = common::next_event(&mut bob).await;
    assert_eq!(remote["type"], "message");
    assert_eq!(remote["payload"]["content"], "across");

    let local = common::next_event(&mut carol).await;
    assert_eq!(local["payload"]["content"], "across");

    // Instance A ignores its own publication; no duplicates anywhere.
    common::expect_silence(&mut carol, Duration::from_millis(200)).await;
    common::expect_silence(&mut bob, Duration::from_millis(200)).await;
    common::expect_silence(&mut alice, Duration::from_millis(200)).await;
    assert_eq!(broker.published(), 1);
}
