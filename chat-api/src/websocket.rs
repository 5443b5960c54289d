use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Extension, Path, Query,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chat_core::{Message, SyncError};
use chat_sync::{ConversationSyncEngine, ConversationView};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing;

use crate::auth::{resolve_device_id, verify_token, AuthenticatedUser};
use crate::error::ApiError;
use crate::server::ApiState;

#[derive(Deserialize)]
pub struct WsQuery {
    token: String,
    #[serde(default)]
    device_id: Option<String>,
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Extension(state): Extension<ApiState>,
    Path(conversation_id): Path<String>,
    Query(query): Query<WsQuery>,
) -> Response {
    let user = match authenticate(&state, &query) {
        Ok(user) => user,
        Err(status) => return status.into_response(),
    };
    let engine = match state.sessions.engine_for(&user) {
        Ok(engine) => engine,
        Err(e) => return ApiError::from(e).into_response(),
    };

    ws.on_upgrade(move |socket| handle_socket(socket, engine, user, conversation_id))
}

fn authenticate(state: &ApiState, query: &WsQuery) -> Result<AuthenticatedUser, StatusCode> {
    let user_id = verify_token(&query.token, &state.ctx.config.server.jwt_secret)?;
    let device_id = resolve_device_id(query.device_id.as_deref())?;
    Ok(AuthenticatedUser { user_id, device_id })
}

async fn handle_socket(
    socket: WebSocket,
    engine: ConversationSyncEngine,
    user: AuthenticatedUser,
    conversation_id: String,
) {
    tracing::info!(
        "WebSocket connection established for {} on {}",
        user.user_id,
        conversation_id
    );

    let (mut sender, mut receiver) = socket.split();

    let view = match engine.open(&conversation_id).await {
        Ok(view) => Some(view),
        // history is cached even without a live channel
        Err(SyncError::SubscriptionFailed(e)) => {
            tracing::warn!("Serving {} without live updates: {}", conversation_id, e);
            engine.watch(&conversation_id)
        }
        Err(e) => {
            tracing::warn!("Failed to open {} over WebSocket: {}", conversation_id, e);
            let _ = sender.send(error_frame(&e.to_string())).await;
            None
        }
    };

    if let Some(mut view) = view {
        if sender.send(snapshot_frame(&view.snapshot())).await.is_ok() {
            forward_updates(&mut view, &mut sender, &mut receiver).await;
        }
    }

    engine.close(&conversation_id).await;
    let _ = sender.close().await;

    tracing::info!(
        "WebSocket connection closed for {} on {}",
        user.user_id,
        conversation_id
    );
}

/// Push every snapshot until the view ends or the peer goes away. Incoming
/// inserts keep the conversation read while it is being viewed.
async fn forward_updates(
    view: &mut ConversationView,
    sender: &mut SplitSink<WebSocket, WsMessage>,
    receiver: &mut SplitStream<WebSocket>,
) {
    let conversation_id = view.conversation_id().to_string();
    loop {
        tokio::select! {
            update = view.changed() => {
                let Some(messages) = update else {
                    // closed elsewhere
                    break;
                };
                if sender.send(snapshot_frame(&messages)).await.is_err() {
                    tracing::debug!("WebSocket peer for {} went away", conversation_id);
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!("WebSocket receive error on {}: {}", conversation_id, e);
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

fn snapshot_frame(messages: &[Message]) -> WsMessage {
    let payload = serde_json::json!({
        "type": "snapshot",
        "messages": messages,
    });
    WsMessage::Text(payload.to_string())
}

fn error_frame(error: &str) -> WsMessage {
    let payload = serde_json::json!({
        "type": "error",
        "error": error,
    });
    WsMessage::Text(payload.to_string())
}
