pub mod conversation;
pub mod message;
pub mod presence;

pub use conversation::{Conversation, ConversationKind, ConversationPage, ConversationSummary};
pub use message::{Message, MessagePage};
pub use presence::{PresenceSnapshot, PresenceStatus};
