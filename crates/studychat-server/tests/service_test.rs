//! End-to-end tests for `ChatService`.
//!
//! Messages go in through `send`, come out on live subscriptions, land in the
//! durable log and the cache, and are visible to history reads and unread
//! counts. Shutdown drains the in-flight batch and read-state flush.

use std::{collections::HashMap, sync::Arc, time::Duration};

use studychat_proto::{ConversationEvent, MessageType};
use studychat_server::{
    ChatConfig, ChatService, ConversationHub, ManualEnv, MemoryCache, MemoryStorage, ServerError,
    Storage, Unread,
};

const NOW_MILLIS: u64 = 1_700_000_000_000;

async fn start(
    storage: MemoryStorage,
    cache: Arc<MemoryCache>,
) -> ChatService<MemoryStorage, ManualEnv> {
    let hub = Arc::new(ConversationHub::default());
    ChatService::start(storage, cache, hub, ChatConfig::default(), ManualEnv::new(NOW_MILLIS))
        .await
        .unwrap()
}

/// The cache is written last, after the durable log and the latest index.
async fn wait_for_cached(cache: &MemoryCache, conversation_id: &str, count: usize) {
    for _ in 0..300 {
        if cache.len(conversation_id).unwrap() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {count} cached messages in {conversation_id}");
}

#[tokio::test]
async fn test_send_reaches_subscribers_and_storage() {
    let storage = MemoryStorage::new();
    let service = start(storage.clone(), Arc::new(MemoryCache::new(100))).await;

    let mut live = service.subscribe("room");
    let sent = service.send("room", "alice", MessageType::Text, "hello").unwrap();

    let ConversationEvent::Message(received) = live.recv().await.unwrap() else {
        panic!("expected a message event");
    };
    assert_eq!(received, sent);

    service.shutdown().await.unwrap();
    assert_eq!(storage.latest_message("room").unwrap(), Some(sent));
}

#[tokio::test]
async fn test_history_and_unread_after_persist() {
    let storage = MemoryStorage::new();
    let cache = Arc::new(MemoryCache::new(100));
    let service = start(storage.clone(), cache.clone()).await;

    let sent: Vec<_> = (0..5)
        .map(|i| service.send("room", "alice", MessageType::Text, &format!("m{i}")).unwrap())
        .collect();
    wait_for_cached(&cache, "room", 5).await;
    assert_eq!(storage.total_message_count(), 5);

    let history = service.get_history("room", &sent[1].id.to_string()).await.unwrap();
    let expected: Vec<_> = sent[1..].iter().rev().cloned().collect();
    assert_eq!(history, expected);

    let pointers = HashMap::from([("room".to_string(), sent[2].id.to_string())]);
    let counts = service.unread_counts(&pointers).await.unwrap();
    assert_eq!(counts["room"].unread, Unread::Exact(2));

    assert_eq!(service.latest("room").unwrap().message_id, sent[4].id);

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_read_receipts_broadcast_and_drained_on_shutdown() {
    let storage = MemoryStorage::new();
    let service = start(storage.clone(), Arc::new(MemoryCache::new(100))).await;

    let message = service.send("room", "alice", MessageType::Text, "hi").unwrap();
    let mut live = service.subscribe("room");
    service.record_read("room", "bob", &message.id.to_string()).unwrap();

    service.shutdown().await.unwrap();

    // The message itself may be fanned out after the subscription started
    let pointers = loop {
        match live.recv().await.unwrap() {
            ConversationEvent::ReadReceipts { pointers, .. } => break pointers,
            ConversationEvent::Message(_) => {},
        }
    };
    assert_eq!(pointers.get("bob"), Some(&message.id));
    assert_eq!(storage.load_read_pointers("room").unwrap().get("bob"), Some(&message.id));
}

#[tokio::test]
async fn test_malformed_ids_rejected() {
    let service = start(MemoryStorage::new(), Arc::new(MemoryCache::new(100))).await;

    assert!(service.record_read("room", "bob", "zz").is_err());
    assert!(service.get_history("room", "").await.is_err());

    let pointers = HashMap::from([("room".to_string(), "not-an-id".to_string())]);
    assert!(matches!(service.unread_counts(&pointers).await, Err(ServerError::Cache(_))));

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalid_shard_is_config_error() {
    let config = ChatConfig { shard_id: 16, ..Default::default() };
    let result = ChatService::start(
        MemoryStorage::new(),
        Arc::new(MemoryCache::new(100)),
        Arc::new(ConversationHub::default()),
        config,
        ManualEnv::new(NOW_MILLIS),
    )
    .await;

    assert!(matches!(result, Err(ServerError::Config(_))));
}

#[tokio::test]
async fn test_latest_index_warmed_on_start() {
    let storage = MemoryStorage::new();
    let first = start(storage.clone(), Arc::new(MemoryCache::new(100))).await;
    let sent = first.send("room", "alice", MessageType::Text, "before restart").unwrap();
    first.shutdown().await.unwrap();

    let second = start(storage, Arc::new(MemoryCache::new(100))).await;
    assert_eq!(second.latest("room").unwrap().message_id, sent.id);
    second.shutdown().await.unwrap();
}
