//! WebSocket transport for the subscriber hub.
//!
//! One socket per agent session. The client subscribes to conversations
//! it is viewing; the server pushes serialized [`super::broadcast::Event`]
//! payloads.

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::SessionHub;

/// Shared state for the hub WebSocket.
#[derive(Clone)]
pub struct WsState {
    pub hub: Arc<SessionHub>,
}

#[derive(Debug, Deserialize)]
pub struct WsParams {
    /// Authenticated agent id. Authentication itself happens upstream;
    /// this surface trusts the forwarded identity.
    pub user_id: i64,
}

/// Client-to-server actions.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientAction {
    Subscribe { conversation_uuid: Uuid },
    Unsubscribe { conversation_uuid: Uuid },
}

/// Build the Axum router for `/ws`.
pub fn hub_routes(hub: Arc<SessionHub>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(WsState { hub })
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<WsState>,
) -> impl IntoResponse {
    info!(user_id = params.user_id, "Hub WebSocket client connecting");
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.user_id))
}

async fn handle_socket(mut socket: WebSocket, state: WsState, user_id: i64) {
    let (session_id, mut rx) = state.hub.register(user_id);
    info!(user_id, %session_id, "Hub WebSocket client connected");

    loop {
        tokio::select! {
            // Forward hub events to this client
            event = rx.recv() => {
                match event {
                    Some(payload) => {
                        if socket.send(Message::Text(payload.into())).await.is_err() {
                            debug!(%session_id, "Hub WS client disconnected during send");
                            break;
                        }
                    }
                    None => {
                        debug!(%session_id, "Hub session channel closed");
                        break;
                    }
                }
            }

            // Receive subscription actions from the client
            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_action(&text, &state, user_id);
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(user_id, %session_id, "Hub WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(%session_id, error = %e, "Hub WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    state.hub.unregister(session_id);
    info!(user_id, %session_id, "Hub WebSocket connection closed");
}

fn handle_client_action(text: &str, state: &WsState, user_id: i64) {
    match serde_json::from_str::<ClientAction>(text) {
        Ok(ClientAction::Subscribe { conversation_uuid }) => {
            debug!(user_id, %conversation_uuid, "Conversation subscribed via WS");
            state.hub.subscribe_conversation(user_id, conversation_uuid);
        }
        Ok(ClientAction::Unsubscribe { conversation_uuid }) => {
            debug!(user_id, %conversation_uuid, "Conversation unsubscribed via WS");
            state.hub.unsubscribe_conversation(user_id, conversation_uuid);
        }
        Err(e) => {
            debug!(error = %e, text, "Unrecognized hub WS message");
        }
    }
}
