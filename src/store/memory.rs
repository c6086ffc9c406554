//! In-memory store. Implements the full contract with process-local state so
//! the delivery engine, gateway and tests run without a database. Not durable;
//! single-process only.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::conversation::direct_key;
use crate::models::{
    Conversation, ConversationKind, ConversationPage, ConversationSummary, Message, MessagePage,
};
use crate::store::{AppendOutcome, ConversationStore};

#[derive(Debug, Clone)]
struct MemberState {
    last_read_at: Option<DateTime<Utc>>,
    last_read_sequence: i64,
    unread_count: i64,
}

impl Default for MemberState {
    fn default() -> Self {
        Self {
            last_read_at: None,
            last_read_sequence: 0,
            unread_count: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    id: Uuid,
    sender_id: Uuid,
    sequence: i64,
    content: String,
    client_nonce: String,
    reply_to: Option<Uuid>,
    delivered_to: Vec<Uuid>,
    deleted_for: Vec<Uuid>,
    created_at: DateTime<Utc>,
}

struct ConversationState {
    kind: ConversationKind,
    title: Option<String>,
    created_by: Uuid,
    last_sequence: i64,
    last_message_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    members: HashMap<Uuid, MemberState>,
    member_order: Vec<Uuid>,
    messages: Vec<StoredMessage>,
}

impl ConversationState {
    fn read_by(&self, sequence: i64) -> Vec<Uuid> {
        self.member_order
            .iter()
            .filter(|m| {
                self.members
                    .get(m)
                    .map(|s| s.last_read_sequence >= sequence)
                    .unwrap_or(false)
            })
            .copied()
            .collect()
    }

    fn materialize(&self, id: Uuid, stored: &StoredMessage) -> Message {
        Message {
            id: stored.id,
            conversation_id: id,
            sender_id: stored.sender_id,
            sequence: stored.sequence,
            content: stored.content.clone(),
            client_nonce: stored.client_nonce.clone(),
            reply_to: stored.reply_to,
            delivered_to: stored.delivered_to.clone(),
            read_by: self.read_by(stored.sequence),
            deleted_for: stored.deleted_for.clone(),
            created_at: stored.created_at,
        }
    }

    fn conversation(&self, id: Uuid) -> Conversation {
        Conversation {
            id,
            kind: self.kind,
            title: self.title.clone(),
            participant_ids: self.member_order.clone(),
            created_by: self.created_by,
            last_message_at: self.last_message_at,
            created_at: self.created_at,
        }
    }

    fn effective_at(&self) -> DateTime<Utc> {
        self.last_message_at.unwrap_or(self.created_at)
    }
}

#[derive(Default)]
struct Inner {
    conversations: HashMap<Uuid, ConversationState>,
    direct_keys: HashMap<String, Uuid>,
}

#[derive(Default)]
pub struct MemoryConversationStore {
    inner: Mutex<Inner>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn new_conversation(
        kind: ConversationKind,
        title: Option<String>,
        created_by: Uuid,
        members: &[Uuid],
    ) -> ConversationState {
        ConversationState {
            kind,
            title,
            created_by,
            last_sequence: 0,
            last_message_at: None,
            created_at: Utc::now(),
            members: members
                .iter()
                .map(|m| (*m, MemberState::default()))
                .collect(),
            member_order: members.to_vec(),
            messages: Vec::new(),
        }
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn get_or_create_direct(&self, a: Uuid, b: Uuid) -> AppResult<Conversation> {
        let key = direct_key(a, b);
        let mut inner = self.inner.lock().expect("store lock poisoned");
        if let Some(id) = inner.direct_keys.get(&key).copied() {
            let state = inner.conversations.get(&id).ok_or(AppError::NotFound)?;
            return Ok(state.conversation(id));
        }
        let id = Uuid::new_v4();
        let state = Self::new_conversation(ConversationKind::Direct, None, a, &[a, b]);
        let conversation = state.conversation(id);
        inner.conversations.insert(id, state);
        inner.direct_keys.insert(key, id);
        Ok(conversation)
    }

    async fn create_group(
        &self,
        creator_id: Uuid,
        title: Option<String>,
        participant_ids: Vec<Uuid>,
    ) -> AppResult<Conversation> {
        let mut members = vec![creator_id];
        for p in participant_ids {
            if !members.contains(&p) {
                members.push(p);
            }
        }
        let id = Uuid::new_v4();
        let state = Self::new_conversation(ConversationKind::Group, title, creator_id, &members);
        let conversation = state.conversation(id);
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.conversations.insert(id, state);
        Ok(conversation)
    }

    async fn get(&self, conversation_id: Uuid) -> AppResult<Conversation> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let state = inner
            .conversations
            .get(&conversation_id)
            .ok_or(AppError::NotFound)?;
        Ok(state.conversation(conversation_id))
    }

    async fn participants(&self, conversation_id: Uuid) -> AppResult<Vec<Uuid>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let state = inner
            .conversations
            .get(&conversation_id)
            .ok_or(AppError::NotFound)?;
        Ok(state.member_order.clone())
    }

    async fn is_participant(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<bool> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner
            .conversations
            .get(&conversation_id)
            .map(|s| s.members.contains_key(&user_id))
            .unwrap_or(false))
    }

    async fn contacts(&self, user_id: Uuid) -> AppResult<Vec<Uuid>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut out = Vec::new();
        for state in inner.conversations.values() {
            if !state.members.contains_key(&user_id) {
                continue;
            }
            for member in &state.member_order {
                if *member != user_id && !out.contains(member) {
                    out.push(*member);
                }
            }
        }
        Ok(out)
    }

    async fn list_for_user(
        &self,
        user_id: Uuid,
        cursor: Option<DateTime<Utc>>,
        limit: i64,
    ) -> AppResult<ConversationPage> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut entries: Vec<(&Uuid, &ConversationState)> = inner
            .conversations
            .iter()
            .filter(|(_, s)| s.members.contains_key(&user_id))
            .filter(|(_, s)| cursor.map(|c| s.effective_at() < c).unwrap_or(true))
            .collect();
        entries.sort_by(|x, y| y.1.effective_at().cmp(&x.1.effective_at()));

        let has_more = entries.len() as i64 > limit;
        let mut conversations = Vec::new();
        let mut next_cursor = None;
        for (id, state) in entries.into_iter().take(limit as usize) {
            next_cursor = Some(state.effective_at());
            let unread_count = state
                .members
                .get(&user_id)
                .map(|m| m.unread_count)
                .unwrap_or(0);
            conversations.push(ConversationSummary {
                conversation: state.conversation(*id),
                unread_count,
            });
        }
        Ok(ConversationPage {
            conversations,
            next_cursor: if has_more { next_cursor } else { None },
        })
    }

    async fn append_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: &str,
        client_nonce: &str,
        reply_to: Option<Uuid>,
    ) -> AppResult<AppendOutcome> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let state = inner
            .conversations
            .get_mut(&conversation_id)
            .ok_or(AppError::NotFound)?;

        if let Some(existing) = state
            .messages
            .iter()
            .find(|m| m.sender_id == sender_id && m.client_nonce == client_nonce)
        {
            let message = state.materialize(conversation_id, existing);
            return Ok(AppendOutcome {
                message,
                created: false,
            });
        }

        if let Some(reply) = reply_to {
            if !state.messages.iter().any(|m| m.id == reply) {
                return Err(AppError::Validation(
                    "reply_to must reference a message in the same conversation".into(),
                ));
            }
        }

        state.last_sequence += 1;
        let now = Utc::now();
        state.last_message_at = Some(now);
        let stored = StoredMessage {
            id: Uuid::new_v4(),
            sender_id,
            sequence: state.last_sequence,
            content: content.to_string(),
            client_nonce: client_nonce.to_string(),
            reply_to,
            delivered_to: Vec::new(),
            deleted_for: Vec::new(),
            created_at: now,
        };
        let message = state.materialize(conversation_id, &stored);
        state.messages.push(stored);
        Ok(AppendOutcome {
            message,
            created: true,
        })
    }

    async fn list_messages(
        &self,
        conversation_id: Uuid,
        viewer_id: Uuid,
        before_sequence: Option<i64>,
        limit: i64,
    ) -> AppResult<MessagePage> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let state = inner
            .conversations
            .get(&conversation_id)
            .ok_or(AppError::NotFound)?;
        let mut visible: Vec<&StoredMessage> = state
            .messages
            .iter()
            .filter(|m| !m.deleted_for.contains(&viewer_id))
            .filter(|m| before_sequence.map(|b| m.sequence < b).unwrap_or(true))
            .collect();
        visible.sort_by_key(|m| std::cmp::Reverse(m.sequence));

        let has_more = visible.len() as i64 > limit;
        let messages = visible
            .into_iter()
            .take(limit as usize)
            .map(|m| state.materialize(conversation_id, m))
            .collect();
        Ok(MessagePage { messages, has_more })
    }

    async fn messages_after(
        &self,
        conversation_id: Uuid,
        viewer_id: Uuid,
        after_sequence: i64,
        limit: i64,
    ) -> AppResult<Vec<Message>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let state = inner
            .conversations
            .get(&conversation_id)
            .ok_or(AppError::NotFound)?;
        let mut visible: Vec<&StoredMessage> = state
            .messages
            .iter()
            .filter(|m| !m.deleted_for.contains(&viewer_id) && m.sequence > after_sequence)
            .collect();
        visible.sort_by_key(|m| m.sequence);
        Ok(visible
            .into_iter()
            .take(limit as usize)
            .map(|m| state.materialize(conversation_id, m))
            .collect())
    }

    async fn mark_delivered(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<()> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let state = inner
            .conversations
            .get_mut(&conversation_id)
            .ok_or(AppError::NotFound)?;
        if let Some(msg) = state.messages.iter_mut().find(|m| m.id == message_id) {
            if !msg.delivered_to.contains(&user_id) {
                msg.delivered_to.push(user_id);
            }
        }
        Ok(())
    }

    async fn mark_read(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        up_to_sequence: i64,
    ) -> AppResult<i64> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let state = inner
            .conversations
            .get_mut(&conversation_id)
            .ok_or(AppError::NotFound)?;
        let watermark = {
            let member = state.members.get(&user_id).ok_or(AppError::NotFound)?;
            member.last_read_sequence.max(up_to_sequence)
        };
        let unread = state
            .messages
            .iter()
            .filter(|m| {
                m.sender_id != user_id
                    && m.sequence > watermark
                    && !m.deleted_for.contains(&user_id)
            })
            .count() as i64;
        let member = state.members.get_mut(&user_id).ok_or(AppError::NotFound)?;
        member.last_read_at = Some(Utc::now());
        member.last_read_sequence = watermark;
        member.unread_count = unread;
        Ok(unread)
    }

    async fn increment_unread(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<i64> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let state = inner
            .conversations
            .get_mut(&conversation_id)
            .ok_or(AppError::NotFound)?;
        let member = state.members.get_mut(&user_id).ok_or(AppError::NotFound)?;
        member.unread_count += 1;
        Ok(member.unread_count)
    }

    async fn delete_for(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<i64> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let state = inner
            .conversations
            .get_mut(&conversation_id)
            .ok_or(AppError::NotFound)?;
        let (sender_id, sequence, newly_deleted) = {
            let msg = state
                .messages
                .iter_mut()
                .find(|m| m.id == message_id)
                .ok_or(AppError::NotFound)?;
            let newly = if msg.deleted_for.contains(&user_id) {
                false
            } else {
                msg.deleted_for.push(user_id);
                true
            };
            (msg.sender_id, msg.sequence, newly)
        };
        let member = state.members.get_mut(&user_id).ok_or(AppError::NotFound)?;
        if newly_deleted && sender_id != user_id && member.last_read_sequence < sequence {
            member.unread_count = (member.unread_count - 1).max(0);
        }
        Ok(member.unread_count)
    }

    async fn latest_sequence(&self, conversation_id: Uuid) -> AppResult<i64> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let state = inner
            .conversations
            .get(&conversation_id)
            .ok_or(AppError::NotFound)?;
        Ok(state.last_sequence)
    }
}
