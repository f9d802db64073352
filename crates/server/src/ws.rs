use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tracing::{debug, warn};

use arena_core::RangeKey;
use arena_db::Db;

use crate::state::{AppState, build_state};

pub async fn upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    // One snapshot up front so a fresh viewer renders without waiting for
    // the next broadcast.
    match snapshot(&state) {
        Ok(envelope) => {
            if socket.send(Message::Text(envelope)).await.is_err() {
                return;
            }
        }
        Err(err) => {
            warn!(event = "ws_snapshot_failed", error = %err);
            return;
        }
    }

    let (conn_id, mut rx) = state.hub.connect().await;
    let (mut sink, mut stream) = socket.split();

    // Writer drains this subscriber's queue; it ends when the hub drops the
    // sender on disconnect.
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(Message::Text(message)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => {
                if is_ping(&text) {
                    let pong = json!({ "type": "pong" }).to_string();
                    state.hub.send_to(conn_id, pong).await;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    debug!(event = "ws_closed", conn_id);
    state.hub.disconnect(conn_id).await;
    writer.abort();
}

fn is_ping(text: &str) -> bool {
    if text == "ping" {
        return true;
    }
    serde_json::from_str::<Value>(text)
        .map(|value| value["type"] == "ping")
        .unwrap_or(false)
}

fn snapshot(state: &AppState) -> arena_db::Result<String> {
    let db = Db::open(&state.db_path)?;
    let data = build_state(&db, state, RangeKey::Today)?;
    Ok(json!({ "type": "state", "data": data }).to_string())
}
