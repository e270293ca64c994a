//! Agent WebSocket sessions
//!
//! An agent connects with its session token, either as an
//! `Authorization: Bearer` header or a `token` query parameter. Inbound text
//! frames are protocol envelopes handed to the control plane; replies and
//! messages pushed through the bus go out on the same socket.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
};
use burrow_control::{AuthenticatedAgent, ControlError};
use burrow_proto::AgentMessage;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::handlers::api_error;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub token: Option<String>,
}

/// Upgrade an authenticated agent to a WebSocket session
pub async fn agent_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(token) = bearer_token(&headers).or(query.token) else {
        return api_error(ControlError::Unauthorized(
            "missing session token".to_string(),
        ))
        .into_response();
    };

    let agent = match state.control.sessions.authenticate(&token).await {
        Ok(agent) => agent,
        Err(e) => return api_error(e).into_response(),
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, agent))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, agent: AuthenticatedAgent) {
    let agent_id = agent.agent_id.clone();
    info!(agent_id = %agent_id, agent_type = ?agent.agent_type, "Agent connected");

    let (mut sender, mut receiver) = socket.split();
    let mut outbox = state.bus.register(&agent_id).await;
    let (reply_tx, mut replies) = mpsc::unbounded_channel::<AgentMessage>();

    let send_agent_id = agent_id.clone();
    let mut send_task = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                queued = outbox.recv() => match queued {
                    Some(message) => message,
                    // the bus dropped this connection
                    None => break,
                },
                Some(message) = replies.recv() => message,
            };

            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!(agent_id = %send_agent_id, "Failed to encode outbound message: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let recv_state = state.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(frame)) = receiver.next().await {
            let text = match frame {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };

            let message: AgentMessage = match serde_json::from_str(text.as_str()) {
                Ok(message) => message,
                Err(e) => {
                    debug!(agent_id = %agent.agent_id, "Dropping malformed frame: {}", e);
                    continue;
                }
            };

            if let Some(reply) = recv_state.control.handler.handle(&agent, message).await {
                if reply_tx.send(reply).is_err() {
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => {
            send_task.abort();
            // the outbox must be dropped before unregistering
            let _ = send_task.await;
        }
    }

    state.bus.unregister(&agent_id).await;
    info!(agent_id = %agent_id, "Agent disconnected");
}
