//! Cross-instance fanout over Redis pub/sub.
//!
//! Each instance publishes delivery-relevant events with the target user set;
//! every instance pushes to whichever of those users hold connections locally.
//! Presence and typing state stay process-local.

use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::websocket::events::ServerEvent;
use crate::websocket::ConnectionRegistry;

const CHANNEL: &str = "orbit:messaging:events";

#[derive(Debug, Serialize, Deserialize)]
struct RemoteEnvelope {
    origin: Uuid,
    recipients: Vec<Uuid>,
    event: ServerEvent,
}

/// Handle used by the delivery engine and unread service to hand events to
/// sibling instances. Cheap to clone.
#[derive(Clone)]
pub struct Publisher {
    client: redis::Client,
    origin: Uuid,
}

impl Publisher {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            origin: Uuid::new_v4(),
        }
    }

    pub fn origin(&self) -> Uuid {
        self.origin
    }

    pub async fn publish(&self, recipients: &[Uuid], event: &ServerEvent) -> redis::RedisResult<()> {
        let envelope = RemoteEnvelope {
            origin: self.origin,
            recipients: recipients.to_vec(),
            event: event.clone(),
        };
        let payload = serde_json::to_string(&envelope)
            .map_err(|_| redis::RedisError::from((redis::ErrorKind::TypeError, "serialize failed")))?;
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.publish::<_, _, ()>(CHANNEL, payload).await
    }
}

/// Listens for sibling-instance events and pushes them to local connections.
/// Runs until the Redis connection dies; the caller decides whether to restart.
pub async fn start_listener(
    client: redis::Client,
    origin: Uuid,
    registry: ConnectionRegistry,
) -> redis::RedisResult<()> {
    // Pub/sub requires a dedicated connection, not a multiplexed one.
    let conn = client.get_async_connection().await?;
    let mut pubsub = conn.into_pubsub();
    pubsub.subscribe(CHANNEL).await?;
    let mut stream = pubsub.on_message();
    use futures_util::StreamExt;
    while let Some(msg) = stream.next().await {
        let payload: String = msg.get_payload()?;
        let envelope: RemoteEnvelope = match serde_json::from_str(&payload) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "discarding malformed fanout envelope");
                continue;
            }
        };
        // Our own publishes already reached local connections directly.
        if envelope.origin == origin {
            continue;
        }
        for user_id in &envelope.recipients {
            registry.push_user(*user_id, &envelope.event).await;
        }
    }
    Ok(())
}
