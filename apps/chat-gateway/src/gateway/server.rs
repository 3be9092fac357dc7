//! WebSocket upgrade handler and per-connection read/write loops.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use messenger_common::UserId;
use tokio::sync::mpsc;
use tokio::time;

use crate::auth::middleware::WsAuth;
use crate::AppState;

use super::events::{ChatEvent, DebugPayload, Frame};
use super::keepalive::KeepalivePolicy;
use super::session::{ClientInfo, Session};

/// Upper bound on frames coalesced into one flush.
const MAX_BATCH_FRAMES: usize = 64;

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(ws_upgrade))
}

async fn ws_upgrade(
    auth: WsAuth,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let client = client_info(&headers);
    let mut ws = ws
        .max_message_size(state.config.gateway.max_message_bytes)
        .max_frame_size(state.config.gateway.max_message_bytes);

    // Browsers require the server to select the subprotocol that carried the
    // credential, or they abort the handshake.
    if let Some(protocol) = auth.protocol {
        ws = ws.protocols([protocol]);
    }

    let user_id = auth.user_id;
    ws.on_upgrade(move |socket| handle_connection(socket, state, user_id, client))
}

fn client_info(headers: &HeaderMap) -> ClientInfo {
    let ip = header(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .or_else(|| header(headers, "x-real-ip"))
        .map(str::to_string);

    ClientInfo {
        ip,
        user_agent: header(headers, "user-agent").map(str::to_string),
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

async fn handle_connection(
    socket: WebSocket,
    state: AppState,
    user_id: UserId,
    client: ClientInfo,
) {
    let settings = &state.config.gateway;

    let (session, outbound) = match Session::new(user_id, client, settings.outbound_capacity) {
        Ok(created) => created,
        Err(err) => {
            tracing::warn!(?err, user_id, "refusing session");
            return;
        }
    };

    if let Some(previous) = state.registry.register(session.clone()) {
        tracing::info!(
            user_id,
            replaced = %previous.connection_id,
            "replaced existing session"
        );
    }

    tracing::info!(
        user_id,
        connection_id = %session.connection_id,
        ip = session.client.ip.as_deref().unwrap_or("-"),
        "gateway session established"
    );

    state.dispatcher.reply(&session, &greeting(&session));

    let (ws_tx, ws_rx) = socket.split();
    let writer = tokio::spawn(write_loop(
        session.clone(),
        ws_tx,
        outbound,
        settings.keepalive,
    ));

    read_loop(&state, &session, ws_rx, settings.keepalive).await;

    state.registry.unregister(&session);
    session.close();
    if let Err(err) = writer.await {
        tracing::warn!(?err, user_id, "write loop panicked");
    }

    tracing::info!(
        user_id,
        connection_id = %session.connection_id,
        "gateway session ended"
    );
}

fn greeting(session: &Session) -> ChatEvent {
    ChatEvent::Debug(DebugPayload {
        client_info: session.client.clone(),
        user_id: session.user_id,
        timestamp: Utc::now(),
        message_data: serde_json::json!({
            "greeting": "connected",
            "connection_id": session.connection_id,
        }),
    })
}

/// Inbound half: every read must complete within the idle window.
async fn read_loop(
    state: &AppState,
    session: &Arc<Session>,
    mut ws_rx: WsStream,
    keepalive: KeepalivePolicy,
) {
    let mut closed = session.closed_signal();

    loop {
        let next = tokio::select! {
            _ = closed.wait_for(|closed| *closed) => break,
            next = time::timeout(keepalive.pong_wait, ws_rx.next()) => next,
        };

        let msg = match next {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                tracing::debug!(?e, user_id = session.user_id, "ws read error");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                tracing::debug!(
                    user_id = session.user_id,
                    idle_ms = session.idle_for().as_millis() as u64,
                    "peer idle past deadline, closing"
                );
                break;
            }
        };

        session.touch();

        let flow = match msg {
            Message::Text(text) => {
                state.handler.handle_frame(session, text.as_str().as_bytes()).await
            }
            Message::Binary(bytes) => state.handler.handle_frame(session, &bytes).await,
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => break,
        };

        if flow.is_break() {
            break;
        }
    }
}

/// Outbound half: drains the queue in batches and pings on a timer. Any
/// write failure ends the session.
async fn write_loop(
    session: Arc<Session>,
    mut ws_tx: WsSink,
    mut outbound: mpsc::Receiver<Frame>,
    keepalive: KeepalivePolicy,
) {
    let mut ticker = time::interval(keepalive.ping_period);
    ticker.tick().await; // First tick fires immediately; skip it.

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    match time::timeout(keepalive.write_wait, send_close(&mut ws_tx)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            tracing::debug!(?e, user_id = session.user_id, "ws close frame failed");
                        }
                        Err(_) => {
                            tracing::debug!(
                                user_id = session.user_id,
                                "ws close deadline exceeded"
                            );
                        }
                    }
                    break;
                };

                let batch = write_batch(&mut ws_tx, frame, &mut outbound);
                match time::timeout(keepalive.write_wait, batch).await {
                    Ok(Ok(written)) => {
                        tracing::trace!(user_id = session.user_id, written, "flushed batch");
                    }
                    Ok(Err(e)) => {
                        tracing::debug!(?e, user_id = session.user_id, "ws write error");
                        break;
                    }
                    Err(_) => {
                        tracing::debug!(user_id = session.user_id, "ws write deadline exceeded");
                        break;
                    }
                }
            }

            _ = ticker.tick() => {
                let ping = ws_tx.send(Message::Ping(Bytes::new()));
                if !matches!(time::timeout(keepalive.write_wait, ping).await, Ok(Ok(()))) {
                    tracing::debug!(user_id = session.user_id, "ping failed");
                    break;
                }
            }
        }
    }

    session.close();
}

/// Write `first` plus whatever is already queued, then flush once.
async fn write_batch(
    ws_tx: &mut WsSink,
    first: Frame,
    outbound: &mut mpsc::Receiver<Frame>,
) -> Result<usize, axum::Error> {
    ws_tx.feed(Message::Text(first.as_str().to_string().into())).await?;
    let mut written = 1;

    while written < MAX_BATCH_FRAMES {
        let Ok(frame) = outbound.try_recv() else {
            break;
        };
        ws_tx.feed(Message::Text(frame.as_str().to_string().into())).await?;
        written += 1;
    }

    ws_tx.flush().await?;
    Ok(written)
}

async fn send_close(ws_tx: &mut WsSink) -> Result<(), axum::Error> {
    ws_tx
        .send(Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: "session closed".to_string().into(),
        })))
        .await
}
