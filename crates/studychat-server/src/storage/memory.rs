#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use studychat_proto::{CacheKey, ChatMessage, CompositeId, ReadPointer};

use super::{Direction, Storage, StorageError};

/// In-memory storage implementation for testing and development
///
/// Each conversation is a `BTreeMap` keyed by [`CacheKey`], so range scans
/// come back in log order. All state is wrapped in Arc<Mutex<>> to allow Clone
/// and concurrent access. Uses `lock().expect()` which will panic if the mutex
/// is poisoned.
#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryStorageInner>>,
}

struct MemoryStorageInner {
    /// Messages per conversation, in key order
    messages: HashMap<String, BTreeMap<CacheKey, ChatMessage>>,

    /// Read pointers, conversation -> user -> message id
    read_pointers: HashMap<String, HashMap<String, CompositeId>>,
}

impl MemoryStorage {
    /// Create a new empty `MemoryStorage`
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryStorageInner {
                messages: HashMap::new(),
                read_pointers: HashMap::new(),
            })),
        }
    }

    /// Total number of messages across all conversations.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    pub fn total_message_count(&self) -> usize {
        let inner = self.inner.lock().expect("Mutex poisoned");
        inner.messages.values().map(BTreeMap::len).sum()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    fn insert_many(&self, messages: &[ChatMessage]) -> Result<Vec<ChatMessage>, StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");

        let mut inserted = Vec::with_capacity(messages.len());
        for message in messages {
            let log = inner.messages.entry(message.conversation_id.clone()).or_default();
            if log.contains_key(&message.cache_key()) {
                continue;
            }
            log.insert(message.cache_key(), message.clone());
            inserted.push(message.clone());
        }

        Ok(inserted)
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    fn range_query(
        &self,
        conversation_id: &str,
        from: CompositeId,
        to: CompositeId,
    ) -> Result<Vec<ChatMessage>, StorageError> {
        let (from, to) = (from.cache_key(), to.cache_key());
        if from >= to {
            return Ok(Vec::new());
        }

        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner
            .messages
            .get(conversation_id)
            .map(|log| log.range(from..to).map(|(_, m)| m.clone()).collect())
            .unwrap_or_default())
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    fn range_from(
        &self,
        conversation_id: &str,
        from: CompositeId,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");

        let Some(log) = inner.messages.get(conversation_id) else {
            return Ok(Vec::new());
        };

        let range = log.range(from.cache_key()..).map(|(_, m)| m.clone());
        Ok(match direction {
            Direction::OldestFirst => range.take(limit).collect(),
            Direction::NewestFirst => range.rev().take(limit).collect(),
        })
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    fn latest_message(&self, conversation_id: &str) -> Result<Option<ChatMessage>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");

        Ok(inner
            .messages
            .get(conversation_id)
            .and_then(|log| log.last_key_value())
            .map(|(_, m)| m.clone()))
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    fn list_conversations(&self) -> Result<Vec<String>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner.messages.keys().cloned().collect())
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    fn store_read_pointers(&self, pointers: &[ReadPointer]) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");

        for pointer in pointers {
            inner
                .read_pointers
                .entry(pointer.conversation_id.clone())
                .or_default()
                .insert(pointer.user_id.clone(), pointer.message_id);
        }

        Ok(())
    }

    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[allow(clippy::expect_used)]
    fn load_read_pointers(
        &self,
        conversation_id: &str,
    ) -> Result<HashMap<String, CompositeId>, StorageError> {
        let inner = self.inner.lock().expect("Mutex poisoned");
        Ok(inner.read_pointers.get(conversation_id).cloned().unwrap_or_default())
    }
}
