use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::Json,
};
use chat_core::{Message, SyncError, UnreadCounts};
use chat_sync::ConversationSyncEngine;
use serde::{Deserialize, Serialize};

use crate::auth::AuthenticatedUser;
use crate::error::ApiError;
use crate::server::ApiState;

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "chat-api"
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    pub conversation_id: String,
    pub messages: Vec<Message>,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct UnreadQuery {
    #[serde(default)]
    pub conversation_ids: Option<String>,
}

fn engine(state: &ApiState, user: &AuthenticatedUser) -> Result<ConversationSyncEngine, ApiError> {
    Ok(state.sessions.engine_for(user)?)
}

pub async fn open_conversation(
    Extension(state): Extension<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(conversation_id): Path<String>,
) -> Result<Json<ConversationSnapshot>, ApiError> {
    let engine = engine(&state, &user)?;
    let view = match engine.open(&conversation_id).await {
        Ok(view) => view,
        // history stays cached for GET .../messages until the client closes
        Err(e @ SyncError::SubscriptionFailed(_)) => return Err(e.into()),
        Err(e) => {
            engine.close(&conversation_id).await;
            return Err(e.into());
        }
    };
    Ok(Json(ConversationSnapshot {
        conversation_id,
        messages: view.snapshot(),
    }))
}

pub async fn close_conversation(
    Extension(state): Extension<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(conversation_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    engine(&state, &user)?.close(&conversation_id).await;
    state.sessions.prune_idle();
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_messages(
    Extension(state): Extension<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(conversation_id): Path<String>,
) -> Result<Json<ConversationSnapshot>, ApiError> {
    let messages = engine(&state, &user)?
        .messages(&conversation_id)
        .ok_or_else(|| ApiError::NotFound(format!("open conversation {}", conversation_id)))?;
    Ok(Json(ConversationSnapshot {
        conversation_id,
        messages,
    }))
}

pub async fn send_message(
    Extension(state): Extension<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(conversation_id): Path<String>,
    Json(request): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<Message>), ApiError> {
    let stored = engine(&state, &user)?
        .send(&conversation_id, &request.content)
        .await?;
    Ok((StatusCode::CREATED, Json(stored)))
}

pub async fn mark_read(
    Extension(state): Extension<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(conversation_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    engine(&state, &user)?.mark_read(&conversation_id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_unread_counts(
    Extension(state): Extension<ApiState>,
    Extension(user): Extension<AuthenticatedUser>,
    Query(params): Query<UnreadQuery>,
) -> Result<Json<UnreadCounts>, ApiError> {
    let ids = parse_id_list(params.conversation_ids.as_deref());
    let counts = engine(&state, &user)?.unread_counts(&ids).await?;
    Ok(Json(counts))
}

/// Split a comma separated id list, dropping blanks and repeats.
fn parse_id_list(raw: Option<&str>) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for id in raw.unwrap_or_default().split(',').map(str::trim) {
        if !id.is_empty() && !ids.iter().any(|seen| seen == id) {
            ids.push(id.to_string());
        }
    }
    ids
}
