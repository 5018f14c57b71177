//! Single-flight property of the read-state coordinator.
//!
//! Writers record pointers while several tasks flush concurrently. Every
//! recorded pointer must be persisted exactly once: no flush may write a
//! pointer another flush already took, and none may be left behind.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use proptest::prelude::*;
use studychat_proto::{ChatMessage, CompositeId, ConversationEvent, ReadPointer};
use studychat_server::{
    ConversationSink, FlushOutcome, ReadStateConfig, ReadStateCoordinator,
    storage::{Direction, MemoryStorage, Storage, StorageError},
};

/// Storage that counts how often each read pointer is written.
#[derive(Clone, Default)]
struct CountingStorage {
    inner: MemoryStorage,
    writes: Arc<Mutex<HashMap<(String, String), Vec<CompositeId>>>>,
}

impl Storage for CountingStorage {
    fn insert_many(&self, messages: &[ChatMessage]) -> Result<Vec<ChatMessage>, StorageError> {
        self.inner.insert_many(messages)
    }

    fn range_query(
        &self,
        conversation_id: &str,
        from: CompositeId,
        to: CompositeId,
    ) -> Result<Vec<ChatMessage>, StorageError> {
        self.inner.range_query(conversation_id, from, to)
    }

    fn range_from(
        &self,
        conversation_id: &str,
        from: CompositeId,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StorageError> {
        self.inner.range_from(conversation_id, from, direction, limit)
    }

    fn latest_message(&self, conversation_id: &str) -> Result<Option<ChatMessage>, StorageError> {
        self.inner.latest_message(conversation_id)
    }

    fn list_conversations(&self) -> Result<Vec<String>, StorageError> {
        self.inner.list_conversations()
    }

    fn store_read_pointers(&self, pointers: &[ReadPointer]) -> Result<(), StorageError> {
        let mut writes = self.writes.lock().unwrap();
        for pointer in pointers {
            writes
                .entry((pointer.conversation_id.clone(), pointer.user_id.clone()))
                .or_default()
                .push(pointer.message_id);
        }
        drop(writes);
        self.inner.store_read_pointers(pointers)
    }

    fn load_read_pointers(
        &self,
        conversation_id: &str,
    ) -> Result<HashMap<String, CompositeId>, StorageError> {
        self.inner.load_read_pointers(conversation_id)
    }
}

#[derive(Default)]
struct CountingSink {
    receipts: Mutex<usize>,
}

impl ConversationSink for CountingSink {
    fn send_to_conversation(&self, _: &str, event: ConversationEvent) -> usize {
        if let ConversationEvent::ReadReceipts { pointers, .. } = event {
            *self.receipts.lock().unwrap() += pointers.len();
        }
        0
    }
}

fn hex(timestamp: u64) -> String {
    CompositeId::new(timestamp, 0, 0).unwrap().to_string()
}

#[test]
fn prop_each_pointer_persisted_exactly_once() {
    proptest!(ProptestConfig::with_cases(32), |(
        writers in 1usize..6,
        per_writer in 1usize..200,
        flushers in 1usize..6,
        conversations in 1usize..8,
    )| {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();

        let storage = CountingStorage::default();
        let sink = Arc::new(CountingSink::default());
        let config = ReadStateConfig { flush_threshold: usize::MAX, ..Default::default() };
        let coordinator = Arc::new(ReadStateCoordinator::new(storage.clone(), sink.clone(), config));

        runtime.block_on(async {
            let mut tasks = Vec::new();
            for writer in 0..writers {
                let coordinator = coordinator.clone();
                tasks.push(tokio::spawn(async move {
                    for i in 0..per_writer {
                        let conversation = format!("conv-{}", i % conversations);
                        let user = format!("user-{writer}-{i}");
                        coordinator.record(&conversation, &user, &hex(i as u64 + 1)).unwrap();
                        if i % 16 == 0 {
                            tokio::task::yield_now().await;
                        }
                    }
                }));
            }
            for _ in 0..flushers {
                let coordinator = coordinator.clone();
                tasks.push(tokio::spawn(async move {
                    for _ in 0..20 {
                        coordinator.flush().await.unwrap();
                        tokio::task::yield_now().await;
                    }
                }));
            }
            for task in tasks {
                task.await.unwrap();
            }

            // Drain whatever the concurrent flushes did not pick up
            while coordinator.flush().await.unwrap() != FlushOutcome::Empty {}
        });

        let writes = storage.writes.lock().unwrap();
        prop_assert_eq!(writes.len(), writers * per_writer);
        for ((_, user), ids) in writes.iter() {
            prop_assert_eq!(ids.len(), 1, "{} persisted {} times", user, ids.len());
        }
        prop_assert_eq!(*sink.receipts.lock().unwrap(), writers * per_writer);
        prop_assert_eq!(coordinator.pending_len(), 0);
    });
}

#[tokio::test]
async fn test_overwritten_pointer_persists_latest_value() {
    let storage = CountingStorage::default();
    let coordinator = ReadStateCoordinator::new(
        storage.clone(),
        Arc::new(CountingSink::default()),
        ReadStateConfig::default(),
    );

    coordinator.record("room", "alice", &hex(1)).unwrap();
    coordinator.record("room", "alice", &hex(9)).unwrap();
    coordinator.flush().await.unwrap();

    let stored = storage.load_read_pointers("room").unwrap();
    assert_eq!(stored["alice"], CompositeId::new(9, 0, 0).unwrap());
    assert_eq!(storage.writes.lock().unwrap()[&("room".to_string(), "alice".to_string())].len(), 1);
}
