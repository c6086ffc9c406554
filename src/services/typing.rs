//! Ephemeral typing state. Entries live in memory with a short TTL; a state
//! whose deadline passed counts as "not typing" whether or not a stop event
//! ever arrived. Updates are last-write-wins and never persisted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::store::ConversationStore;
use crate::websocket::events::ServerEvent;
use crate::websocket::ConnectionRegistry;

pub struct TypingCoordinator {
    store: Arc<dyn ConversationStore>,
    registry: ConnectionRegistry,
    ttl: Duration,
    deadlines: RwLock<HashMap<(Uuid, Uuid), Instant>>,
}

impl TypingCoordinator {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        registry: ConnectionRegistry,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            ttl,
            deadlines: RwLock::new(HashMap::new()),
        }
    }

    pub async fn start_typing(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<()> {
        if !self.store.is_participant(conversation_id, user_id).await? {
            return Err(AppError::Forbidden);
        }
        {
            let mut guard = self.deadlines.write().await;
            guard.insert((conversation_id, user_id), Instant::now() + self.ttl);
        }
        self.broadcast(conversation_id, user_id, true).await;
        Ok(())
    }

    pub async fn stop_typing(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<()> {
        if !self.store.is_participant(conversation_id, user_id).await? {
            return Err(AppError::Forbidden);
        }
        let was_present = {
            let mut guard = self.deadlines.write().await;
            guard.remove(&(conversation_id, user_id)).is_some()
        };
        if was_present {
            self.broadcast(conversation_id, user_id, false).await;
        }
        Ok(())
    }

    /// Users currently typing in the conversation; expired entries are
    /// treated as absent regardless of whether a stop ever arrived.
    pub async fn active_typists(&self, conversation_id: Uuid) -> Vec<Uuid> {
        let now = Instant::now();
        let guard = self.deadlines.read().await;
        guard
            .iter()
            .filter(|((conv, _), deadline)| *conv == conversation_id && **deadline > now)
            .map(|((_, user), _)| *user)
            .collect()
    }

    /// Sweeps out expired entries and broadcasts the stop that the client
    /// never sent (crashed tab, dropped frame). Consumers that only read
    /// `active_typists` don't need the sweeper; it exists so push-only
    /// clients also see the indicator clear.
    pub fn spawn_sweeper(self: Arc<Self>) {
        let period = (self.ttl / 2).max(Duration::from_millis(50));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let now = Instant::now();
                let expired: Vec<(Uuid, Uuid)> = {
                    let mut guard = self.deadlines.write().await;
                    let gone: Vec<(Uuid, Uuid)> = guard
                        .iter()
                        .filter(|(_, deadline)| **deadline <= now)
                        .map(|(k, _)| *k)
                        .collect();
                    for key in &gone {
                        guard.remove(key);
                    }
                    gone
                };
                for (conversation_id, user_id) in expired {
                    self.broadcast(conversation_id, user_id, false).await;
                }
            }
        });
    }

    async fn broadcast(&self, conversation_id: Uuid, user_id: Uuid, is_typing: bool) {
        let participants = match self.store.participants(conversation_id).await {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(error = %e, %conversation_id, "typing broadcast skipped");
                return;
            }
        };
        let event = ServerEvent::TypingChanged {
            conversation_id,
            user_id,
            is_typing,
        };
        for participant in participants {
            if participant != user_id {
                self.registry.push_user(participant, &event).await;
            }
        }
    }
}
