//! Unread counters and read receipts. Counters are persisted per
//! (user, conversation) on the membership row so every device of a user
//! agrees after reconnecting; watermark semantics: a `read` up to sequence N
//! marks everything at or below N.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::store::ConversationStore;
use crate::websocket::events::ServerEvent;
use crate::websocket::pubsub::Publisher;
use crate::websocket::ConnectionRegistry;

pub struct UnreadService {
    store: Arc<dyn ConversationStore>,
    registry: ConnectionRegistry,
    publisher: Option<Publisher>,
}

impl UnreadService {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        registry: ConnectionRegistry,
        publisher: Option<Publisher>,
    ) -> Self {
        Self {
            store,
            registry,
            publisher,
        }
    }

    /// Sets the reader's watermark, zeroes/recomputes their counter, syncs the
    /// counter to all of their devices and sends the read receipt to the other
    /// participants. `up_to_sequence = None` reads everything assigned so far.
    pub async fn mark_conversation_read(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        up_to_sequence: Option<i64>,
    ) -> AppResult<i64> {
        if !self.store.is_participant(conversation_id, user_id).await? {
            return Err(AppError::Forbidden);
        }
        let up_to = match up_to_sequence {
            Some(seq) => seq,
            None => self.store.latest_sequence(conversation_id).await?,
        };
        let count = self.store.mark_read(conversation_id, user_id, up_to).await?;

        let unread_event = ServerEvent::UnreadUpdated {
            conversation_id,
            count,
        };
        self.registry.push_user(user_id, &unread_event).await;

        let receipt = ServerEvent::ReadReceipt {
            conversation_id,
            user_id,
            up_to_sequence: up_to,
        };
        let participants = self.store.participants(conversation_id).await?;
        for participant in &participants {
            if *participant != user_id {
                self.registry.push_user(*participant, &receipt).await;
            }
        }

        if let Some(publisher) = &self.publisher {
            if let Err(e) = publisher.publish(&[user_id], &unread_event).await {
                tracing::warn!(error = %e, "failed to publish unread update");
            }
            let others: Vec<Uuid> = participants
                .into_iter()
                .filter(|p| *p != user_id)
                .collect();
            if let Err(e) = publisher.publish(&others, &receipt).await {
                tracing::warn!(error = %e, "failed to publish read receipt");
            }
        }

        Ok(count)
    }

    /// Pushes the current counter of every conversation to all of the user's
    /// live connections; called when a connection authenticates so freshly
    /// opened tabs agree with the rest.
    pub async fn sync_to_devices(&self, user_id: Uuid) -> AppResult<()> {
        let page = self.store.list_for_user(user_id, None, 100).await?;
        for summary in page.conversations {
            self.registry
                .push_user(
                    user_id,
                    &ServerEvent::UnreadUpdated {
                        conversation_id: summary.conversation.id,
                        count: summary.unread_count,
                    },
                )
                .await;
        }
        Ok(())
    }

    /// Soft-deletes a message for one user and re-syncs their counter.
    pub async fn delete_message_for(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<()> {
        if !self.store.is_participant(conversation_id, user_id).await? {
            return Err(AppError::Forbidden);
        }
        let count = self
            .store
            .delete_for(conversation_id, message_id, user_id)
            .await?;
        self.registry
            .push_user(
                user_id,
                &ServerEvent::UnreadUpdated {
                    conversation_id,
                    count,
                },
            )
            .await;
        Ok(())
    }
}
