//! The realtime socket route
//!
//! `GET /ws?token=<user id>&role=driver|passenger`. The token carries
//! the upstream-verified identity; the role selects the subscriber set.
//! Events arrive as JSON envelopes `{"type": ..., ...payload}`; the
//! first frame on every connection is a `connection_ack`.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use corrida_types::{Role, UserId};

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: String,
    pub role: String,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Ok(user) = Uuid::parse_str(&query.token) else {
        return (StatusCode::FORBIDDEN, "invalid token").into_response();
    };
    let Some(role) = Role::parse(&query.role) else {
        return (StatusCode::FORBIDDEN, "invalid role").into_response();
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, UserId::from_uuid(user), role))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, user: UserId, role: Role) {
    let (mut sender, mut receiver) = socket.split();
    let (channel, mut rx) = state.router.subscribe(user, role);

    // Forward routed events to this client until either side goes away.
    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "event serialization failed"),
            }
        }
    });

    // The client sends nothing we act on today; we only watch for close.
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Text(_) | Message::Binary(_) => {}
        }
    }

    state.router.unsubscribe(user, role, channel);
    send_task.abort();
    debug!(%user, %role, "socket closed");
}
