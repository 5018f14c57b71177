//! Chat message records.
//!
//! Messages are created once by the sender-facing entry point and never
//! mutated afterwards. The same record travels through the ingestion
//! pipeline, the durable log and the recency cache.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::id::{CacheKey, CompositeId};

/// Maximum number of characters kept in [`MessageSummary::preview`].
pub const SUMMARY_PREVIEW_CHARS: usize = 80;

/// Kind of message content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    /// Plain text
    Text,
    /// Image reference (the upload itself happens elsewhere)
    Image,
    /// System status line (joined, left, started a session)
    Status,
}

impl MessageType {
    /// Wire name (`TEXT`, `IMAGE`, `STATUS`).
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Image => "IMAGE",
            Self::Status => "STATUS",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown message type name.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown message type: {0:?}")]
pub struct UnknownMessageType(pub String);

impl FromStr for MessageType {
    type Err = UnknownMessageType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TEXT" => Ok(Self::Text),
            "IMAGE" => Ok(Self::Image),
            "STATUS" => Ok(Self::Status),
            other => Err(UnknownMessageType(other.to_string())),
        }
    }
}

/// Immutable chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Composite id (hex on the wire)
    pub id: CompositeId,
    /// Content kind
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Conversation this message belongs to
    pub conversation_id: String,
    /// Author
    pub sender_id: String,
    /// Text body or image reference
    pub content: String,
}

impl ChatMessage {
    /// Create a message.
    pub fn new(
        id: CompositeId,
        kind: MessageType,
        conversation_id: impl Into<String>,
        sender_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id,
            kind,
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            content: content.into(),
        }
    }

    /// Ordering key shared by the cache and the durable log.
    pub fn cache_key(&self) -> CacheKey {
        self.id.cache_key()
    }

    /// Denormalized summary for conversation lists.
    pub fn summary(&self) -> MessageSummary {
        MessageSummary::from(self)
    }
}

/// Denormalized view of a conversation's newest message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSummary {
    /// Id of the summarized message
    pub message_id: CompositeId,
    /// Content kind
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Author
    pub sender_id: String,
    /// Content truncated to [`SUMMARY_PREVIEW_CHARS`] characters
    pub preview: String,
}

impl From<&ChatMessage> for MessageSummary {
    fn from(message: &ChatMessage) -> Self {
        Self {
            message_id: message.id,
            kind: message.kind,
            sender_id: message.sender_id.clone(),
            preview: message.content.chars().take(SUMMARY_PREVIEW_CHARS).collect(),
        }
    }
}
