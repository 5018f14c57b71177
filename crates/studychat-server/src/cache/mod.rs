//! Bounded recency cache.
//!
//! Per-conversation ordered log of the most recent messages, keyed by
//! [`CacheKey`]. Logs are append-only and trimmed from the oldest end once
//! they pass the capacity `N`; trimming is approximate, so a log may briefly
//! hold a few more than `N` entries. There is no TTL.
//!
//! Two backends: [`MemoryCache`] (in-process) and [`RedisCache`] (one Redis
//! stream per conversation). Both order entries by cache key, the same order
//! the durable log uses.

mod memory;
mod redis;

use std::{cmp::Ordering, collections::HashMap};

use async_trait::async_trait;
pub use memory::MemoryCache;
use studychat_proto::{
    CacheKey, ChatMessage, CompositeId, IdentifierError, MessageSummary, MessageType,
};
use thiserror::Error;

pub use self::redis::RedisCache;

/// Errors that can occur during cache operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// A message id could not be encoded
    #[error("identifier error: {0}")]
    Identifier(#[from] IdentifierError),

    /// The backend is unreachable or rejected the command
    #[error("cache backend error: {0}")]
    Backend(String),

    /// Append key is not newer than the conversation's newest entry
    #[error("out of order append to {conversation_id}: {key} is not after {newest}")]
    OutOfOrder {
        /// Conversation
        conversation_id: String,
        /// Rejected key
        key: CacheKey,
        /// Newest key already cached
        newest: CacheKey,
    },

    /// A cached entry could not be decoded
    #[error("corrupt cache entry: {0}")]
    Corrupt(String),

    /// Some items of a batch append failed; the rest were applied
    #[error("{} batch appends failed", .failures.len())]
    Partial {
        /// Failed message ids with their errors
        failures: Vec<(CompositeId, CacheError)>,
    },
}

/// Field projection stored for each cached message.
///
/// The conversation id is implied by the log the entry lives in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Message id
    pub id: CompositeId,
    /// Content kind
    pub kind: MessageType,
    /// Author
    pub sender_id: String,
    /// Content
    pub content: String,
}

impl CacheEntry {
    /// Project a message into a cache entry.
    pub fn from_message(message: &ChatMessage) -> Self {
        Self {
            id: message.id,
            kind: message.kind,
            sender_id: message.sender_id.clone(),
            content: message.content.clone(),
        }
    }

    /// Rebuild the full message.
    pub fn into_message(self, conversation_id: &str) -> ChatMessage {
        ChatMessage::new(self.id, self.kind, conversation_id, self.sender_id, self.content)
    }
}

/// Result of probing one conversation's log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeWindow {
    /// Key of the oldest cached entry
    pub oldest: Option<CacheKey>,
    /// Newest cached message
    pub newest: Option<ChatMessage>,
    /// Entries strictly after the probed key, capped at the probe limit
    pub after: usize,
}

/// Unread classification for one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unread {
    /// Exact number of unread messages
    Exact(usize),
    /// The pointer is beyond the cache horizon; at least this many are unread
    AtLeast(usize),
    /// The pointer is newer than anything cached (clock skew, stale client)
    Inconsistent,
}

/// Unread count and newest-message summary of one conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadCount {
    /// Classification
    pub unread: Unread,
    /// Summary of the newest cached message
    pub latest: Option<MessageSummary>,
}

impl UnreadCount {
    /// Wire count: the number for `Exact`/`AtLeast`, `-1` for `Inconsistent`.
    pub fn count(&self) -> i64 {
        match self.unread {
            Unread::Exact(n) | Unread::AtLeast(n) => n as i64,
            Unread::Inconsistent => -1,
        }
    }
}

/// Classify a read pointer against a probe taken with limit `capacity + 1`.
pub fn classify(pointer: CacheKey, window: &ProbeWindow, capacity: usize) -> Unread {
    let (Some(oldest), Some(newest)) = (window.oldest, window.newest.as_ref()) else {
        return Unread::Exact(0);
    };

    match pointer.cmp(&newest.cache_key()) {
        Ordering::Greater => Unread::Inconsistent,
        Ordering::Equal => Unread::Exact(0),
        Ordering::Less if pointer < oldest || window.after > capacity => {
            Unread::AtLeast(capacity)
        },
        Ordering::Less => Unread::Exact(window.after),
    }
}

/// Per-conversation capped log of recent messages.
///
/// Appends within one conversation must arrive in key order; an entry whose
/// key is not newer than the conversation's newest entry is rejected.
#[async_trait]
pub trait RecencyCache: Send + Sync + 'static {
    /// Soft cap `N` on entries per conversation.
    fn capacity(&self) -> usize;

    /// Append one message.
    async fn append(&self, message: &ChatMessage) -> Result<(), CacheError> {
        match self.append_batch(std::slice::from_ref(message)).await {
            Err(CacheError::Partial { mut failures }) if failures.len() == 1 => {
                Err(failures.pop().map_or_else(
                    || CacheError::Backend("empty failure list".to_string()),
                    |(_, err)| err,
                ))
            },
            other => other,
        }
    }

    /// Append messages in one lock or round trip.
    ///
    /// Items are applied independently: failed items are reported in
    /// [`CacheError::Partial`] and do not stop the others.
    async fn append_batch(&self, messages: &[ChatMessage]) -> Result<(), CacheError>;

    /// Newest cached message of a conversation.
    async fn latest(&self, conversation_id: &str) -> Result<Option<ChatMessage>, CacheError>;

    /// Cached messages with key `>= from`, newest first, at most `N`.
    ///
    /// Empty when the conversation is not cached or `from` is newer than the
    /// newest entry.
    async fn since(
        &self,
        conversation_id: &str,
        from: CacheKey,
    ) -> Result<Vec<ChatMessage>, CacheError>;

    /// Probe many conversations in one round trip.
    ///
    /// Conversations without cached entries may be absent from the result.
    async fn probe_many(
        &self,
        pointers: &[(String, CacheKey)],
        limit: usize,
    ) -> Result<HashMap<String, ProbeWindow>, CacheError>;

    /// Unread counts for a set of read pointers (conversation -> last read id).
    ///
    /// One probe of size `N + 1` per conversation, all in one round trip.
    async fn unread_counts(
        &self,
        pointers: &HashMap<String, CompositeId>,
    ) -> Result<HashMap<String, UnreadCount>, CacheError> {
        let capacity = self.capacity();
        let probes: Vec<(String, CacheKey)> =
            pointers.iter().map(|(c, id)| (c.clone(), id.cache_key())).collect();

        let windows = self.probe_many(&probes, capacity + 1).await?;

        Ok(probes
            .into_iter()
            .map(|(conversation_id, pointer)| {
                let window = windows.get(&conversation_id).cloned().unwrap_or_default();
                let count = UnreadCount {
                    unread: classify(pointer, &window, capacity),
                    latest: window.newest.as_ref().map(ChatMessage::summary),
                };
                (conversation_id, count)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(timestamp: u64) -> ChatMessage {
        let id = CompositeId::new(timestamp, 0, 0).expect("valid id");
        ChatMessage::new(id, MessageType::Text, "room", "alice", "hi")
    }

    fn key(timestamp: u64) -> CacheKey {
        message(timestamp).cache_key()
    }

    fn window(oldest: u64, newest: u64, after: usize) -> ProbeWindow {
        ProbeWindow { oldest: Some(key(oldest)), newest: Some(message(newest)), after }
    }

    #[test]
    fn test_classify_empty_window() {
        assert_eq!(classify(key(5), &ProbeWindow::default(), 100), Unread::Exact(0));
    }

    #[test]
    fn test_classify_pointer_positions() {
        let w = window(10, 50, 0);
        assert_eq!(classify(key(50), &w, 100), Unread::Exact(0));
        assert_eq!(classify(key(60), &w, 100), Unread::Inconsistent);
        assert_eq!(classify(key(5), &w, 100), Unread::AtLeast(100));

        let w = window(10, 50, 7);
        assert_eq!(classify(key(43), &w, 100), Unread::Exact(7));
    }

    #[test]
    fn test_classify_probe_overflow() {
        let w = window(1, 200, 101);
        assert_eq!(classify(key(2), &w, 100), Unread::AtLeast(100));
    }

    #[test]
    fn test_wire_count() {
        let count = |unread| UnreadCount { unread, latest: None }.count();
        assert_eq!(count(Unread::Exact(3)), 3);
        assert_eq!(count(Unread::AtLeast(100)), 100);
        assert_eq!(count(Unread::Inconsistent), -1);
    }

    #[test]
    fn test_entry_projection() {
        let original = message(9);
        let entry = CacheEntry::from_message(&original);
        assert_eq!(entry.into_message("room"), original);
    }
}
