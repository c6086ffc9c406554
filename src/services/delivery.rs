//! Message Delivery Engine.
//!
//! `send` validates, persists (obtaining the per-conversation sequence),
//! updates unread counters and fans the message out to every participant's
//! live connections. The persist-to-fanout window is serialized per
//! conversation so every connection observes `message.created` events in
//! sequence order; sends in different conversations proceed fully in
//! parallel. Persistence failure aborts the send before any fan-out; fan-out
//! failures are best-effort and left to resume/history to repair.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::Message;
use crate::store::ConversationStore;
use crate::websocket::events::ServerEvent;
use crate::websocket::pubsub::Publisher;
use crate::websocket::ConnectionRegistry;

pub struct DeliveryEngine {
    store: Arc<dyn ConversationStore>,
    registry: ConnectionRegistry,
    publisher: Option<Publisher>,
    send_locks: RwLock<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl DeliveryEngine {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        registry: ConnectionRegistry,
        publisher: Option<Publisher>,
    ) -> Self {
        Self {
            store,
            registry,
            publisher,
            send_locks: RwLock::new(HashMap::new()),
        }
    }

    pub async fn send(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        content: &str,
        client_nonce: &str,
        reply_to: Option<Uuid>,
    ) -> AppResult<Message> {
        let content = content.trim();
        if content.is_empty() {
            return Err(AppError::Validation("message content is empty".into()));
        }
        if client_nonce.trim().is_empty() {
            return Err(AppError::Validation("client_nonce is required".into()));
        }

        let participants = self.store.participants(conversation_id).await?;
        if !participants.contains(&sender_id) {
            return Err(AppError::Forbidden);
        }

        let lock = self.conversation_lock(conversation_id).await;
        let guard = lock.lock().await;

        let outcome = self
            .store
            .append_message(conversation_id, sender_id, content, client_nonce, reply_to)
            .await?;

        if !outcome.created {
            // Retry of a send that already landed: hand back the stored
            // message, no second fan-out, no double counting.
            drop(guard);
            self.release_lock(conversation_id, lock).await;
            return Ok(outcome.message);
        }
        metrics::MESSAGES_SENT_TOTAL.inc();

        let mut message = outcome.message;
        for participant in &participants {
            let event = ServerEvent::MessageCreated {
                message: message.clone(),
            };
            let delivered = self.registry.push_user(*participant, &event).await;
            if delivered > 0 {
                // Online at push time: record delivery. Failure here is not
                // fatal; the recipient dedupes by id on the resume path.
                if let Err(e) = self
                    .store
                    .mark_delivered(conversation_id, message.id, *participant)
                    .await
                {
                    tracing::warn!(error = %e, user_id = %participant, "mark_delivered failed");
                } else if !message.delivered_to.contains(participant) {
                    message.delivered_to.push(*participant);
                }
            }

            if *participant == sender_id {
                continue;
            }
            // A participant with a connection actively viewing the
            // conversation reads the message as it arrives; no unread bump.
            if self.registry.is_viewing(*participant, conversation_id).await {
                continue;
            }
            match self
                .store
                .increment_unread(conversation_id, *participant)
                .await
            {
                Ok(count) => {
                    self.registry
                        .push_user(
                            *participant,
                            &ServerEvent::UnreadUpdated {
                                conversation_id,
                                count,
                            },
                        )
                        .await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, user_id = %participant, "unread increment failed");
                }
            }
        }

        drop(guard);
        self.release_lock(conversation_id, lock).await;

        if let Some(publisher) = &self.publisher {
            let event = ServerEvent::MessageCreated {
                message: message.clone(),
            };
            if let Err(e) = publisher.publish(&participants, &event).await {
                tracing::warn!(error = %e, "failed to publish message to sibling instances");
            }
        }

        Ok(message)
    }

    async fn conversation_lock(&self, conversation_id: Uuid) -> Arc<Mutex<()>> {
        {
            let guard = self.send_locks.read().await;
            if let Some(lock) = guard.get(&conversation_id) {
                return lock.clone();
            }
        }
        let mut guard = self.send_locks.write().await;
        guard
            .entry(conversation_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops the lock entry once nobody else holds it, so the map does not
    /// grow with every conversation ever touched.
    async fn release_lock(&self, conversation_id: Uuid, lock: Arc<Mutex<()>>) {
        drop(lock);
        let mut guard = self.send_locks.write().await;
        if let Some(existing) = guard.get(&conversation_id) {
            if Arc::strong_count(existing) == 1 {
                guard.remove(&conversation_id);
            }
        }
    }
}
