use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::middleware::auth::User;
use crate::models::{Message, MessagePage};
use crate::state::AppState;
use crate::store::ConversationStore;

#[derive(Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    /// Client-generated idempotency key; retries reuse it and get the
    /// original message back.
    pub client_nonce: String,
    pub reply_to: Option<Uuid>,
}

pub async fn send_message(
    State(state): State<AppState>,
    user: User,
    Path(conversation_id): Path<Uuid>,
    Json(body): Json<SendMessageRequest>,
) -> Result<Json<Message>, crate::error::AppError> {
    let message = state
        .delivery
        .send(
            conversation_id,
            user.id,
            &body.content,
            &body.client_nonce,
            body.reply_to,
        )
        .await?;
    Ok(Json(message))
}

#[derive(Deserialize)]
pub struct ListMessagesParams {
    /// Cursor: return messages with sequence strictly below this.
    pub before_sequence: Option<i64>,
    pub page_size: Option<i64>,
}

pub async fn list_messages(
    State(state): State<AppState>,
    user: User,
    Path(conversation_id): Path<Uuid>,
    Query(params): Query<ListMessagesParams>,
) -> Result<Json<MessagePage>, crate::error::AppError> {
    if !state.store.is_participant(conversation_id, user.id).await? {
        return Err(crate::error::AppError::Forbidden);
    }
    let page_size = params.page_size.unwrap_or(50).clamp(1, 200);
    let page = state
        .store
        .list_messages(conversation_id, user.id, params.before_sequence, page_size)
        .await?;
    Ok(Json(page))
}

/// Soft delete: hides the message for the caller only; other participants'
/// views are untouched.
pub async fn delete_message(
    State(state): State<AppState>,
    user: User,
    Path((conversation_id, message_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, crate::error::AppError> {
    state
        .unread
        .delete_message_for(conversation_id, message_id, user.id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
