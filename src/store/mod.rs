//! Conversation Store contract.
//!
//! The store is the system of record for conversations, messages, read
//! watermarks and unread counters, and the only shared state with
//! cross-process consistency requirements. The two operations that need the
//! store's transactional primitives are direct-pair uniqueness
//! (`get_or_create_direct`) and per-conversation sequence assignment
//! (`append_message`); everything else is plain reads and monotonic updates.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{Conversation, ConversationPage, Message, MessagePage};

pub use memory::MemoryConversationStore;
pub use postgres::PgConversationStore;

/// Result of `append_message`. `created` is false when the (sender, nonce)
/// pair was already stored and the existing message is returned instead.
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    pub message: Message,
    pub created: bool,
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Idempotent: concurrent calls for the same pair converge on one
    /// conversation via the uniqueness constraint on the sorted pair, with
    /// create-then-fetch-on-conflict as the fallback path.
    async fn get_or_create_direct(&self, a: Uuid, b: Uuid) -> AppResult<Conversation>;

    async fn create_group(
        &self,
        creator_id: Uuid,
        title: Option<String>,
        participant_ids: Vec<Uuid>,
    ) -> AppResult<Conversation>;

    async fn get(&self, conversation_id: Uuid) -> AppResult<Conversation>;

    async fn participants(&self, conversation_id: Uuid) -> AppResult<Vec<Uuid>>;

    async fn is_participant(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<bool>;

    /// Users sharing at least one conversation with `user_id`; the audience
    /// for that user's presence broadcasts.
    async fn contacts(&self, user_id: Uuid) -> AppResult<Vec<Uuid>>;

    /// Ordered by `last_message_at desc` (creation time for conversations
    /// without messages), cursor-paginated.
    async fn list_for_user(
        &self,
        user_id: Uuid,
        cursor: Option<DateTime<Utc>>,
        limit: i64,
    ) -> AppResult<ConversationPage>;

    /// Atomically assigns the next sequence for the conversation and bumps
    /// `last_message_at`. Strictly increasing, no duplicates, gaps allowed,
    /// safe under concurrent senders.
    async fn append_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: &str,
        client_nonce: &str,
        reply_to: Option<Uuid>,
    ) -> AppResult<AppendOutcome>;

    /// Newest-first page of messages visible to `viewer_id` (their soft
    /// deletions filtered out), `before_sequence` as the cursor.
    async fn list_messages(
        &self,
        conversation_id: Uuid,
        viewer_id: Uuid,
        before_sequence: Option<i64>,
        limit: i64,
    ) -> AppResult<MessagePage>;

    /// Ascending messages with sequence greater than `after_sequence`; the
    /// resume path for reconnecting clients.
    async fn messages_after(
        &self,
        conversation_id: Uuid,
        viewer_id: Uuid,
        after_sequence: i64,
        limit: i64,
    ) -> AppResult<Vec<Message>>;

    async fn mark_delivered(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<()>;

    /// Advances the viewer's read watermark (never backwards), stamps
    /// `last_read_at`, recomputes the unread counter and returns it.
    async fn mark_read(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        up_to_sequence: i64,
    ) -> AppResult<i64>;

    /// Returns the new counter value.
    async fn increment_unread(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<i64>;

    /// Soft-deletes the message for `user_id` only and returns that user's
    /// adjusted unread counter.
    async fn delete_for(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<i64>;

    async fn latest_sequence(&self, conversation_id: Uuid) -> AppResult<i64>;
}
