use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A stored message. Append-only: after insert only `delivered_to`, `read_by`
/// and `deleted_for` grow. `read_by` is derived from the participants' read
/// watermarks, not stored per message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    /// Server-assigned, strictly increasing per conversation. Gaps allowed.
    pub sequence: i64,
    pub content: String,
    pub client_nonce: String,
    pub reply_to: Option<Uuid>,
    pub delivered_to: Vec<Uuid>,
    pub read_by: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deleted_for: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub has_more: bool,
}
