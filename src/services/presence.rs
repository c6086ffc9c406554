//! In-memory presence. State is process-local and rebuilt from reconnects
//! after a restart; only transitions are broadcast, and only to users who
//! share a conversation with the subject.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::metrics;
use crate::models::{PresenceSnapshot, PresenceStatus};
use crate::store::ConversationStore;
use crate::websocket::events::ServerEvent;
use crate::websocket::ConnectionRegistry;

struct PresenceEntry {
    connections: HashSet<Uuid>,
    status: PresenceStatus,
    last_active_at: DateTime<Utc>,
    /// Bumped on every connect. Grace timers capture the epoch at disconnect
    /// and stand down if it moved, so a reconnect within the grace period is
    /// never observed as `offline`.
    epoch: u64,
}

pub struct PresenceTracker {
    store: Arc<dyn ConversationStore>,
    registry: ConnectionRegistry,
    grace: Duration,
    idle: Duration,
    entries: RwLock<HashMap<Uuid, PresenceEntry>>,
}

impl PresenceTracker {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        registry: ConnectionRegistry,
        grace: Duration,
        idle: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            grace,
            idle,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn on_connect(&self, user_id: Uuid, connection_id: Uuid) {
        let became_online = {
            let mut guard = self.entries.write().await;
            let entry = guard.entry(user_id).or_insert_with(|| {
                metrics::PRESENCE_ONLINE.inc();
                PresenceEntry {
                    connections: HashSet::new(),
                    status: PresenceStatus::Offline,
                    last_active_at: Utc::now(),
                    epoch: 0,
                }
            });
            entry.epoch += 1;
            entry.connections.insert(connection_id);
            entry.last_active_at = Utc::now();
            let was_offline = entry.status == PresenceStatus::Offline;
            entry.status = PresenceStatus::Online;
            was_offline
        };
        if became_online {
            self.broadcast(user_id, PresenceStatus::Online).await;
        }
    }

    /// Deregisters the connection. When it was the last one, the user stays
    /// in their current status for the grace period; only if no connection
    /// returns do they transition to `offline`.
    pub async fn on_disconnect(self: Arc<Self>, user_id: Uuid, connection_id: Uuid) {
        let timer_epoch = {
            let mut guard = self.entries.write().await;
            let Some(entry) = guard.get_mut(&user_id) else {
                return;
            };
            entry.connections.remove(&connection_id);
            if entry.connections.is_empty() {
                Some(entry.epoch)
            } else {
                None
            }
        };
        let Some(epoch) = timer_epoch else { return };

        let tracker = self;
        tokio::spawn(async move {
            tokio::time::sleep(tracker.grace).await;
            let went_offline = {
                let mut guard = tracker.entries.write().await;
                match guard.get(&user_id) {
                    Some(entry) if entry.epoch == epoch && entry.connections.is_empty() => {
                        guard.remove(&user_id);
                        metrics::PRESENCE_ONLINE.dec();
                        true
                    }
                    _ => false,
                }
            };
            if went_offline {
                tracker.broadcast(user_id, PresenceStatus::Offline).await;
            }
        });
    }

    /// Activity ping: refreshes `last_active_at` and lifts an `away` user
    /// back to `online`.
    pub async fn touch(&self, user_id: Uuid) {
        let promoted = {
            let mut guard = self.entries.write().await;
            let Some(entry) = guard.get_mut(&user_id) else {
                return;
            };
            entry.last_active_at = Utc::now();
            if entry.status == PresenceStatus::Away && !entry.connections.is_empty() {
                entry.status = PresenceStatus::Online;
                true
            } else {
                false
            }
        };
        if promoted {
            self.broadcast(user_id, PresenceStatus::Online).await;
        }
    }

    /// Never `offline` while a connection is registered, and still the last
    /// live status during the post-disconnect grace window.
    pub async fn status_of(&self, user_id: Uuid) -> PresenceStatus {
        let guard = self.entries.read().await;
        guard
            .get(&user_id)
            .map(|e| e.status)
            .unwrap_or(PresenceStatus::Offline)
    }

    pub async fn snapshot(&self, user_id: Uuid) -> PresenceSnapshot {
        let guard = self.entries.read().await;
        match guard.get(&user_id) {
            Some(entry) => PresenceSnapshot {
                user_id,
                status: entry.status,
                connection_count: entry.connections.len(),
                last_active_at: entry.last_active_at,
            },
            None => PresenceSnapshot {
                user_id,
                status: PresenceStatus::Offline,
                connection_count: 0,
                last_active_at: Utc::now(),
            },
        }
    }

    /// Demotes idle-but-connected users to `away`. Runs for the lifetime of
    /// the process.
    pub fn spawn_idle_sweeper(self: Arc<Self>) {
        let period = (self.idle / 4).max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let idle_cutoff = Utc::now()
                    - chrono::Duration::from_std(self.idle)
                        .unwrap_or_else(|_| chrono::Duration::seconds(300));
                let demoted: Vec<Uuid> = {
                    let mut guard = self.entries.write().await;
                    let mut out = Vec::new();
                    for (user_id, entry) in guard.iter_mut() {
                        if entry.status == PresenceStatus::Online
                            && !entry.connections.is_empty()
                            && entry.last_active_at < idle_cutoff
                        {
                            entry.status = PresenceStatus::Away;
                            out.push(*user_id);
                        }
                    }
                    out
                };
                for user_id in demoted {
                    self.broadcast(user_id, PresenceStatus::Away).await;
                }
            }
        });
    }

    async fn broadcast(&self, user_id: Uuid, status: PresenceStatus) {
        let contacts = match self.store.contacts(user_id).await {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!(error = %e, %user_id, "presence broadcast skipped");
                return;
            }
        };
        let event = ServerEvent::PresenceChanged { user_id, status };
        for contact in contacts {
            self.registry.push_user(contact, &event).await;
        }
    }
}
