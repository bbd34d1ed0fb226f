//! WebSocket signaling endpoint: `/ws?clientID=<id>`.
//!
//! Each connection is a thin relay between the browser's JSON envelopes and
//! the signaling hub -- all negotiation logic lives in
//! [`crate::webrtc::hub`], not here.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::webrtc::Envelope;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(rename = "clientID")]
    client_id: String,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<Response> {
    let client_id = query.client_id.trim().to_string();
    if client_id.is_empty() {
        return Err(AppError::BadRequest("clientID must not be empty".to_string()));
    }

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, client_id, state)))
}

async fn handle_socket(socket: WebSocket, client_id: String, state: Arc<AppState>) {
    info!(client_id = %client_id, "viewer WebSocket connected");
    let (mut sender, mut receiver) = socket.split();
    let mut outbound = state.hub.register(client_id.clone());
    let cancel = state.shutdown_token();

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<Envelope>(&text) {
                            Ok(envelope) => state.hub.dispatch(envelope),
                            Err(e) => warn!(client_id = %client_id, error = %e, "malformed signaling envelope"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(client_id = %client_id, "viewer WebSocket disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(client_id = %client_id, error = %e, "WebSocket receive error");
                        break;
                    }
                    _ => {}
                }
            }
            outgoing = outbound.recv() => {
                match outgoing {
                    Some(envelope) => {
                        let Ok(json) = serde_json::to_string(&envelope) else { continue };
                        if sender.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = cancel.cancelled() => {
                info!(client_id = %client_id, "closing viewer WebSocket for shutdown");
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
        }
    }

    state.hub.unregister(client_id);
}
