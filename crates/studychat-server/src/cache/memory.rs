#![allow(clippy::disallowed_types, reason = "Lock is never held across an await")]

use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use studychat_proto::{CacheKey, ChatMessage};

use super::{CacheEntry, CacheError, ProbeWindow, RecencyCache};

type Log = VecDeque<(CacheKey, CacheEntry)>;

/// In-process recency cache.
///
/// One `VecDeque` per conversation, sorted by key. A log is trimmed back to
/// `capacity` once it grows past `capacity + trim_slack`, which amortizes
/// trimming the same way an approximate stream cap does.
///
/// Keys must grow per conversation: an append at or below the newest cached
/// key fails with [`CacheError::OutOfOrder`], matching a stream's `XADD`.
#[derive(Debug)]
pub struct MemoryCache {
    capacity: usize,
    trim_slack: usize,
    logs: Mutex<HashMap<String, Log>>,
}

impl MemoryCache {
    /// Cache holding about `capacity` entries per conversation, trimmed
    /// eagerly.
    pub fn new(capacity: usize) -> Self {
        Self::with_trim_slack(capacity, 0)
    }

    /// Cache that lets a log exceed `capacity` by up to `trim_slack` entries
    /// before trimming.
    pub fn with_trim_slack(capacity: usize, trim_slack: usize) -> Self {
        Self { capacity, trim_slack, logs: Mutex::new(HashMap::new()) }
    }

    /// Number of entries currently cached for a conversation.
    pub fn len(&self, conversation_id: &str) -> Result<usize, CacheError> {
        Ok(self.logs()?.get(conversation_id).map_or(0, VecDeque::len))
    }

    fn logs(&self) -> Result<MutexGuard<'_, HashMap<String, Log>>, CacheError> {
        self.logs.lock().map_err(|_| CacheError::Backend("memory cache lock poisoned".to_string()))
    }
}

#[async_trait]
impl RecencyCache for MemoryCache {
    fn capacity(&self) -> usize {
        self.capacity
    }

    async fn append_batch(&self, messages: &[ChatMessage]) -> Result<(), CacheError> {
        let mut logs = self.logs()?;

        let mut failures = Vec::new();
        for message in messages {
            let key = message.cache_key();
            let log = logs.entry(message.conversation_id.clone()).or_default();

            if let Some(newest) = log.back().map(|(k, _)| *k).filter(|newest| key <= *newest) {
                failures.push((
                    message.id,
                    CacheError::OutOfOrder {
                        conversation_id: message.conversation_id.clone(),
                        key,
                        newest,
                    },
                ));
                continue;
            }

            log.push_back((key, CacheEntry::from_message(message)));

            if log.len() > self.capacity + self.trim_slack {
                let excess = log.len() - self.capacity;
                log.drain(..excess);
            }
        }

        if failures.is_empty() { Ok(()) } else { Err(CacheError::Partial { failures }) }
    }

    async fn latest(&self, conversation_id: &str) -> Result<Option<ChatMessage>, CacheError> {
        let logs = self.logs()?;
        Ok(logs
            .get(conversation_id)
            .and_then(VecDeque::back)
            .map(|(_, entry)| entry.clone().into_message(conversation_id)))
    }

    async fn since(
        &self,
        conversation_id: &str,
        from: CacheKey,
    ) -> Result<Vec<ChatMessage>, CacheError> {
        let logs = self.logs()?;
        let Some(log) = logs.get(conversation_id) else {
            return Ok(Vec::new());
        };

        let start = log.partition_point(|(key, _)| *key < from);
        Ok(log
            .range(start..)
            .rev()
            .take(self.capacity)
            .map(|(_, entry)| entry.clone().into_message(conversation_id))
            .collect())
    }

    async fn probe_many(
        &self,
        pointers: &[(String, CacheKey)],
        limit: usize,
    ) -> Result<HashMap<String, ProbeWindow>, CacheError> {
        let logs = self.logs()?;

        let mut windows = HashMap::with_capacity(pointers.len());
        for (conversation_id, pointer) in pointers {
            let Some(log) = logs.get(conversation_id) else {
                continue;
            };

            let after = log.len() - log.partition_point(|(key, _)| key <= pointer);
            windows.insert(
                conversation_id.clone(),
                ProbeWindow {
                    oldest: log.front().map(|(key, _)| *key),
                    newest: log
                        .back()
                        .map(|(_, entry)| entry.clone().into_message(conversation_id)),
                    after: after.min(limit),
                },
            );
        }

        Ok(windows)
    }
}

#[cfg(test)]
mod tests {
    use studychat_proto::{CompositeId, MessageType};

    use super::*;

    fn create_test_message(conversation_id: &str, timestamp: u64) -> ChatMessage {
        let id = CompositeId::new(timestamp, 0, 0).expect("valid id");
        ChatMessage::new(id, MessageType::Text, conversation_id, "alice", format!("m{timestamp}"))
    }

    #[tokio::test]
    async fn test_trims_to_capacity_past_slack() {
        let cache = MemoryCache::with_trim_slack(10, 5);

        for t in 1..=15 {
            cache.append(&create_test_message("room", t)).await.expect("append failed");
        }
        assert_eq!(cache.len("room").unwrap(), 15);

        cache.append(&create_test_message("room", 16)).await.expect("append failed");
        assert_eq!(cache.len("room").unwrap(), 10);

        let oldest = cache.since("room", CompositeId::new(0, 0, 0).unwrap().cache_key()).await;
        assert_eq!(oldest.unwrap().last().unwrap().id.timestamp(), 7);
    }

    #[tokio::test]
    async fn test_rejects_out_of_order_append() {
        let cache = MemoryCache::new(10);
        cache.append(&create_test_message("room", 5)).await.expect("append failed");

        let err = cache.append(&create_test_message("room", 5)).await.unwrap_err();
        assert!(matches!(err, CacheError::OutOfOrder { .. }));

        let err = cache
            .append_batch(&[create_test_message("room", 3), create_test_message("room", 6)])
            .await
            .unwrap_err();
        match err {
            CacheError::Partial { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].0.timestamp(), 3);
            },
            other => panic!("expected Partial, got {other:?}"),
        }
        assert_eq!(cache.latest("room").await.unwrap().unwrap().id.timestamp(), 6);
    }

    #[tokio::test]
    async fn test_since_is_newest_first_and_inclusive() {
        let cache = MemoryCache::new(100);
        let batch: Vec<_> = (1..=10).map(|t| create_test_message("room", t)).collect();
        cache.append_batch(&batch).await.expect("append failed");

        let since = cache.since("room", batch[6].cache_key()).await.unwrap();
        let stamps: Vec<_> = since.iter().map(|m| m.id.timestamp()).collect();
        assert_eq!(stamps, [10, 9, 8, 7]);

        let newer = create_test_message("room", 11).cache_key();
        assert!(cache.since("room", newer).await.unwrap().is_empty());
        assert!(cache.since("other", newer).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_probe_counts_entries_after_pointer() {
        let cache = MemoryCache::new(100);
        let batch: Vec<_> = (1..=10).map(|t| create_test_message("room", t)).collect();
        cache.append_batch(&batch).await.expect("append failed");

        let probes = vec![
            ("room".to_string(), batch[3].cache_key()),
            ("empty".to_string(), batch[3].cache_key()),
        ];
        let windows = cache.probe_many(&probes, 4).await.unwrap();

        let window = &windows["room"];
        assert_eq!(window.after, 4);
        assert_eq!(window.oldest, Some(batch[0].cache_key()));
        assert_eq!(window.newest.as_ref(), Some(&batch[9]));
        assert!(!windows.contains_key("empty"));
    }
}
