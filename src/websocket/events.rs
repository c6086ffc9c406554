//! WebSocket event shapes, validated at the gateway boundary.
//!
//! Both directions are tagged unions with an `object.action` `type` tag; a
//! frame that does not parse into `ClientEvent` yields an `error` event back
//! on that connection, never a disconnect.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Message, PresenceStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// In-band authentication for transports that cannot set the token on the
    /// upgrade request. Must arrive first, within the handshake timeout.
    #[serde(rename = "auth")]
    Auth { token: String },

    #[serde(rename = "send")]
    Send {
        conversation_id: Uuid,
        content: String,
        client_nonce: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<Uuid>,
    },

    #[serde(rename = "typing.start")]
    TypingStart { conversation_id: Uuid },

    #[serde(rename = "typing.stop")]
    TypingStop { conversation_id: Uuid },

    #[serde(rename = "read")]
    Read {
        conversation_id: Uuid,
        up_to_sequence: i64,
    },

    #[serde(rename = "resume")]
    Resume {
        conversation_id: Uuid,
        after_sequence: i64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "message.created")]
    MessageCreated { message: Message },

    #[serde(rename = "presence.changed")]
    PresenceChanged {
        user_id: Uuid,
        status: PresenceStatus,
    },

    #[serde(rename = "typing.changed")]
    TypingChanged {
        conversation_id: Uuid,
        user_id: Uuid,
        is_typing: bool,
    },

    #[serde(rename = "unread.updated")]
    UnreadUpdated { conversation_id: Uuid, count: i64 },

    #[serde(rename = "read.receipt")]
    ReadReceipt {
        conversation_id: Uuid,
        user_id: Uuid,
        up_to_sequence: i64,
    },

    #[serde(rename = "error")]
    Error { code: String, message: String },
}

impl ServerEvent {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn from_app_error(err: &crate::error::AppError) -> Self {
        use crate::error::AppError;
        let code = match err {
            AppError::Unauthorized => "auth_error",
            AppError::Validation(_) => "validation_error",
            AppError::Forbidden => "forbidden",
            AppError::NotFound => "not_found",
            AppError::TransientStore(_) => "transient_store_error",
            AppError::Database(_) if err.is_retryable() => "transient_store_error",
            _ => "internal_error",
        };
        ServerEvent::error(code, err.to_string())
    }
}
