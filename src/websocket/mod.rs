use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::Message;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::metrics;
use crate::websocket::events::ServerEvent;

pub mod events;
pub mod handlers;
pub mod pubsub;

struct ConnectionSlot {
    id: Uuid,
    tx: Sender<Message>,
    /// Conversation this connection is currently viewing, per its latest
    /// `read`/`resume` event. Drives the "skip unread increment" rule.
    focused: Option<Uuid>,
}

/// Registry of live connections, keyed by user. A user may hold any number of
/// simultaneous connections (tabs/devices); pushes fan to all of them.
///
/// Outbound queues are bounded. A connection whose queue is full when a push
/// arrives is dropped from the registry, which ends its socket task, shedding
/// the slow consumer instead of blocking the sender.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<Uuid, Vec<ConnectionSlot>>>>,
    queue_capacity: usize,
}

impl ConnectionRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Registers a new connection for `user_id` and returns its id plus the
    /// receiving end of its outbound queue.
    pub async fn register(&self, user_id: Uuid) -> (Uuid, Receiver<Message>) {
        let (tx, rx) = channel(self.queue_capacity);
        let id = Uuid::new_v4();
        let mut guard = self.inner.write().await;
        guard.entry(user_id).or_default().push(ConnectionSlot {
            id,
            tx,
            focused: None,
        });
        (id, rx)
    }

    /// Removes a connection; returns how many connections the user still has.
    pub async fn deregister(&self, user_id: Uuid, connection_id: Uuid) -> usize {
        let mut guard = self.inner.write().await;
        let remaining = match guard.get_mut(&user_id) {
            Some(slots) => {
                slots.retain(|s| s.id != connection_id);
                slots.len()
            }
            None => 0,
        };
        if remaining == 0 {
            guard.remove(&user_id);
        }
        remaining
    }

    pub async fn set_focus(&self, user_id: Uuid, connection_id: Uuid, conversation: Option<Uuid>) {
        let mut guard = self.inner.write().await;
        if let Some(slots) = guard.get_mut(&user_id) {
            if let Some(slot) = slots.iter_mut().find(|s| s.id == connection_id) {
                slot.focused = conversation;
            }
        }
    }

    /// Whether any of the user's connections is currently viewing the
    /// conversation.
    pub async fn is_viewing(&self, user_id: Uuid, conversation_id: Uuid) -> bool {
        let guard = self.inner.read().await;
        guard
            .get(&user_id)
            .map(|slots| slots.iter().any(|s| s.focused == Some(conversation_id)))
            .unwrap_or(false)
    }

    pub async fn connection_count(&self, user_id: Uuid) -> usize {
        let guard = self.inner.read().await;
        guard.get(&user_id).map(|s| s.len()).unwrap_or(0)
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.connection_count(user_id).await > 0
    }

    /// Fans an event to every live connection of `user_id`. Returns how many
    /// connections accepted it. Connections that cannot keep up are dropped
    /// (their socket task observes the closed queue and shuts the socket).
    pub async fn push_user(&self, user_id: Uuid, event: &ServerEvent) -> usize {
        let payload = match serde_json::to_string(event) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize server event");
                return 0;
            }
        };
        self.push_raw(user_id, &payload).await
    }

    pub async fn push_raw(&self, user_id: Uuid, payload: &str) -> usize {
        let mut guard = self.inner.write().await;
        let Some(slots) = guard.get_mut(&user_id) else {
            return 0;
        };
        let mut delivered = 0;
        slots.retain(|slot| {
            match slot.tx.try_send(Message::Text(payload.to_string())) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    metrics::FANOUT_DROPPED_TOTAL.inc();
                    tracing::warn!(
                        %user_id,
                        connection_id = %slot.id,
                        "outbound queue overflow, dropping connection"
                    );
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
        if slots.is_empty() {
            guard.remove(&user_id);
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_reaches_every_connection_of_a_user() {
        let registry = ConnectionRegistry::new(8);
        let user = Uuid::new_v4();
        let (_id1, mut rx1) = registry.register(user).await;
        let (_id2, mut rx2) = registry.register(user).await;

        let event = ServerEvent::UnreadUpdated {
            conversation_id: Uuid::new_v4(),
            count: 3,
        };
        assert_eq!(registry.push_user(user, &event).await, 2);
        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
    }

    #[tokio::test]
    async fn overflowing_connection_is_shed_without_blocking() {
        let registry = ConnectionRegistry::new(1);
        let user = Uuid::new_v4();
        let (_id, mut rx) = registry.register(user).await;

        let event = ServerEvent::UnreadUpdated {
            conversation_id: Uuid::new_v4(),
            count: 1,
        };
        assert_eq!(registry.push_user(user, &event).await, 1);
        // Queue now full; the next push must shed the connection, not block.
        assert_eq!(registry.push_user(user, &event).await, 0);
        assert_eq!(registry.connection_count(user).await, 0);
        // The socket task sees the queue close after draining what was sent.
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn focus_tracking_follows_the_connection() {
        let registry = ConnectionRegistry::new(8);
        let user = Uuid::new_v4();
        let conversation = Uuid::new_v4();
        let (id, _rx) = registry.register(user).await;

        assert!(!registry.is_viewing(user, conversation).await);
        registry.set_focus(user, id, Some(conversation)).await;
        assert!(registry.is_viewing(user, conversation).await);
        registry.deregister(user, id).await;
        assert!(!registry.is_viewing(user, conversation).await);
    }
}
