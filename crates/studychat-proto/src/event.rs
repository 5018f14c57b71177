//! Events delivered to live conversation subscribers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{id::CompositeId, message::ChatMessage};

/// Last message a user acknowledged in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadPointer {
    /// Conversation
    pub conversation_id: String,
    /// Reader
    pub user_id: String,
    /// Last acknowledged message
    pub message_id: CompositeId,
}

/// Payload pushed to the live subscribers of one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ConversationEvent {
    /// A newly produced message.
    Message(ChatMessage),

    /// A flushed batch of read pointers for the conversation.
    #[serde(rename_all = "camelCase")]
    ReadReceipts {
        /// Conversation the pointers belong to
        conversation_id: String,
        /// User id -> last acknowledged message id
        pointers: BTreeMap<String, CompositeId>,
    },
}
