//! Latest-message index.
//!
//! Conversation id -> summary of its newest persisted message. Written by the
//! persistence worker after each durable batch; read lock-free by conversation
//! list queries.

use std::{collections::HashMap, sync::Arc};

use dashmap::{DashMap, mapref::entry::Entry};
use studychat_proto::{ChatMessage, MessageSummary};

use crate::storage::{Storage, StorageError, run_blocking};

/// Concurrent map of each conversation's newest message summary.
///
/// Clone is cheap; clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct LatestIndex {
    entries: Arc<DashMap<String, MessageSummary>>,
}

impl LatestIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the message's summary unless one with a higher composite id is
    /// already indexed.
    ///
    /// Composite order puts the shard before the sequence, so for two shards
    /// writing in the same millisecond it can differ from cache-key order.
    ///
    /// Returns `true` if the index changed.
    pub fn upsert_if_newer(&self, message: &ChatMessage) -> bool {
        match self.entries.entry(message.conversation_id.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().message_id >= message.id {
                    return false;
                }
                entry.insert(message.summary());
                true
            },
            Entry::Vacant(entry) => {
                entry.insert(message.summary());
                true
            },
        }
    }

    /// Index the newest message of each conversation in a batch.
    pub fn record_batch(&self, messages: &[ChatMessage]) -> usize {
        let mut newest: HashMap<&str, &ChatMessage> = HashMap::new();
        for message in messages {
            newest
                .entry(message.conversation_id.as_str())
                .and_modify(|current| {
                    if message.id > current.id {
                        *current = message;
                    }
                })
                .or_insert(message);
        }

        newest.values().filter(|message| self.upsert_if_newer(message)).count()
    }

    /// Summary of a conversation's newest message.
    pub fn get(&self, conversation_id: &str) -> Option<MessageSummary> {
        self.entries.get(conversation_id).map(|entry| entry.value().clone())
    }

    /// Number of indexed conversations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rebuild from the durable log (startup).
    ///
    /// Returns the number of conversations indexed.
    pub async fn warm<S: Storage>(&self, storage: &S) -> Result<usize, StorageError> {
        let latest = run_blocking(storage, |storage| {
            let mut latest = Vec::new();
            for conversation_id in storage.list_conversations()? {
                if let Some(message) = storage.latest_message(&conversation_id)? {
                    latest.push(message);
                }
            }
            Ok(latest)
        })
        .await?;

        let indexed = self.record_batch(&latest);
        tracing::info!(conversations = indexed, "Latest-message index warmed");
        Ok(indexed)
    }
}

#[cfg(test)]
mod tests {
    use studychat_proto::{CompositeId, MessageType};

    use super::*;
    use crate::storage::MemoryStorage;

    fn create_test_message(conversation_id: &str, timestamp: u64) -> ChatMessage {
        let id = CompositeId::new(timestamp, 0, 0).expect("valid id");
        ChatMessage::new(id, MessageType::Text, conversation_id, "alice", format!("m{timestamp}"))
    }

    #[test]
    fn test_keeps_newest() {
        let index = LatestIndex::new();

        assert!(index.upsert_if_newer(&create_test_message("room", 5)));
        assert!(!index.upsert_if_newer(&create_test_message("room", 3)));
        assert_eq!(index.get("room").unwrap().preview, "m5");
    }

    #[test]
    fn test_record_batch_picks_max_per_conversation() {
        let index = LatestIndex::new();
        let batch = [
            create_test_message("a", 2),
            create_test_message("b", 9),
            create_test_message("a", 7),
            create_test_message("a", 4),
        ];

        assert_eq!(index.record_batch(&batch), 2);
        assert_eq!(index.get("a").unwrap().message_id.timestamp(), 7);
        assert_eq!(index.get("b").unwrap().message_id.timestamp(), 9);
    }

    #[test]
    fn test_same_millisecond_higher_composite_wins() {
        let message = |shard, sequence| {
            let id = CompositeId::new(100, shard, sequence).expect("valid id");
            ChatMessage::new(id, MessageType::Text, "room", "alice", "hi")
        };
        let (shard_one, shard_zero) = (message(1, 0), message(0, 1));
        // Cache-key order disagrees with composite order here
        assert!(shard_one.id > shard_zero.id);
        assert!(shard_one.cache_key() < shard_zero.cache_key());

        let index = LatestIndex::new();
        index.record_batch(&[shard_one.clone(), shard_zero.clone()]);
        assert_eq!(index.get("room").unwrap().message_id, shard_one.id);

        assert!(!index.upsert_if_newer(&shard_zero));
        assert_eq!(index.get("room").unwrap().message_id, shard_one.id);
    }

    #[tokio::test]
    async fn test_warm_from_storage() {
        let storage = MemoryStorage::new();
        storage
            .insert_many(&[
                create_test_message("a", 1),
                create_test_message("a", 3),
                create_test_message("b", 2),
            ])
            .unwrap();

        let index = LatestIndex::new();
        assert_eq!(index.warm(&storage).await.unwrap(), 2);
        assert_eq!(index.get("a").unwrap().message_id.timestamp(), 3);
    }
}
