use crate::middleware::auth::User;
use crate::models::{Conversation, ConversationPage};
use crate::state::AppState;
use crate::store::ConversationStore;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Deserialize)]
pub struct CreateDirectConversationRequest {
    pub other_user_id: Uuid,
}

/// Get-or-create the direct conversation with another user ("message this
/// user" from a profile page). Idempotent: repeated and concurrent calls for
/// the same pair return the same conversation.
pub async fn create_direct_conversation(
    State(state): State<AppState>,
    user: User,
    Json(body): Json<CreateDirectConversationRequest>,
) -> Result<Json<Conversation>, crate::error::AppError> {
    if body.other_user_id == user.id {
        return Err(crate::error::AppError::Validation(
            "cannot open a direct conversation with yourself".into(),
        ));
    }
    let conversation = state
        .store
        .get_or_create_direct(user.id, body.other_user_id)
        .await?;
    Ok(Json(conversation))
}

#[derive(Deserialize)]
pub struct CreateGroupConversationRequest {
    pub title: Option<String>,
    pub participant_ids: Vec<Uuid>,
}

pub async fn create_group_conversation(
    State(state): State<AppState>,
    user: User,
    Json(body): Json<CreateGroupConversationRequest>,
) -> Result<(StatusCode, Json<Conversation>), crate::error::AppError> {
    let others: Vec<Uuid> = body
        .participant_ids
        .into_iter()
        .filter(|p| *p != user.id)
        .collect();
    if others.is_empty() {
        return Err(crate::error::AppError::Validation(
            "a group needs at least one participant besides the creator".into(),
        ));
    }
    if let Some(ref title) = body.title {
        if title.len() > 255 {
            return Err(crate::error::AppError::Validation(
                "group title too long (max 255)".into(),
            ));
        }
    }
    let conversation = state
        .store
        .create_group(user.id, body.title, others)
        .await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

#[derive(Deserialize)]
pub struct ListConversationsParams {
    pub cursor: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

pub async fn list_conversations(
    State(state): State<AppState>,
    user: User,
    Query(params): Query<ListConversationsParams>,
) -> Result<Json<ConversationPage>, crate::error::AppError> {
    let limit = params.limit.unwrap_or(50).clamp(1, 100);
    let page = state
        .store
        .list_for_user(user.id, params.cursor, limit)
        .await?;
    Ok(Json(page))
}

#[derive(Deserialize, Default)]
pub struct MarkAsReadRequest {
    /// Watermark sequence; omitted means "everything assigned so far".
    pub up_to_sequence: Option<i64>,
}

#[derive(Serialize)]
pub struct MarkAsReadResponse {
    pub conversation_id: Uuid,
    pub unread_count: i64,
}

pub async fn mark_as_read(
    State(state): State<AppState>,
    user: User,
    Path(id): Path<Uuid>,
    body: Option<Json<MarkAsReadRequest>>,
) -> Result<Json<MarkAsReadResponse>, crate::error::AppError> {
    let up_to = body.and_then(|Json(b)| b.up_to_sequence);
    let unread_count = state
        .unread
        .mark_conversation_read(id, user.id, up_to)
        .await?;
    Ok(Json(MarkAsReadResponse {
        conversation_id: id,
        unread_count,
    }))
}
