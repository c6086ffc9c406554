use std::sync::Arc;

use crate::{
    config::Config,
    services::{DeliveryEngine, PresenceTracker, TypingCoordinator, UnreadService},
    store::ConversationStore,
    websocket::pubsub::Publisher,
    websocket::ConnectionRegistry,
};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ConversationStore>,
    pub registry: ConnectionRegistry,
    pub presence: Arc<PresenceTracker>,
    pub typing: Arc<TypingCoordinator>,
    pub delivery: Arc<DeliveryEngine>,
    pub unread: Arc<UnreadService>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Wires the messaging components around a store backend. The caller
    /// spawns the background sweepers (`spawn_background_tasks`) once per
    /// process.
    pub fn build(
        store: Arc<dyn ConversationStore>,
        config: Arc<Config>,
        publisher: Option<Publisher>,
    ) -> Self {
        let registry = ConnectionRegistry::new(config.ws_send_queue_capacity);
        let presence = Arc::new(PresenceTracker::new(
            store.clone(),
            registry.clone(),
            config.presence_grace,
            config.presence_idle,
        ));
        let typing = Arc::new(TypingCoordinator::new(
            store.clone(),
            registry.clone(),
            config.typing_ttl,
        ));
        let delivery = Arc::new(DeliveryEngine::new(
            store.clone(),
            registry.clone(),
            publisher.clone(),
        ));
        let unread = Arc::new(UnreadService::new(
            store.clone(),
            registry.clone(),
            publisher,
        ));
        Self {
            store,
            registry,
            presence,
            typing,
            delivery,
            unread,
            config,
        }
    }

    pub fn spawn_background_tasks(&self) {
        self.presence.clone().spawn_idle_sweeper();
        self.typing.clone().spawn_sweeper();
    }
}
