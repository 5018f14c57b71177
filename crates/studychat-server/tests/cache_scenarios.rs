//! Recency cache scenarios.
//!
//! Capacity bound, the `since` window after trimming, and unread-count
//! classification against the cache horizon.

use std::collections::HashMap;

use studychat_proto::{ChatMessage, CompositeId, MessageType};
use studychat_server::{MemoryCache, RecencyCache, Unread};

const CAPACITY: usize = 100;

fn create_test_message(conversation_id: &str, timestamp: u64) -> ChatMessage {
    let id = CompositeId::new(timestamp, 0, 0).unwrap();
    ChatMessage::new(id, MessageType::Text, conversation_id, "alice", format!("message {timestamp}"))
}

/// Cache holding messages 1..=count of `room`, appended one by one.
async fn filled_cache(count: u64) -> MemoryCache {
    let cache = MemoryCache::new(CAPACITY);
    for timestamp in 1..=count {
        cache.append(&create_test_message("room", timestamp)).await.unwrap();
    }
    cache
}

fn id(timestamp: u64) -> CompositeId {
    CompositeId::new(timestamp, 0, 0).unwrap()
}

#[tokio::test]
async fn test_capacity_bound_holds() {
    let cache = filled_cache(150).await;
    assert_eq!(cache.len("room").unwrap(), CAPACITY);

    let latest = cache.latest("room").await.unwrap().unwrap();
    assert_eq!(latest.id.timestamp(), 150);
}

#[tokio::test]
async fn test_since_after_overflow() {
    let cache = filled_cache(150).await;

    let window = cache.since("room", id(120).cache_key()).await.unwrap();
    assert_eq!(window.len(), 31);
    assert_eq!(window.first().unwrap().id.timestamp(), 150);
    assert_eq!(window.last().unwrap().id.timestamp(), 120);
}

#[tokio::test]
async fn test_since_before_horizon_returns_whole_window() {
    let cache = filled_cache(150).await;

    let window = cache.since("room", id(1).cache_key()).await.unwrap();
    assert_eq!(window.len(), CAPACITY);
    assert_eq!(window.last().unwrap().id.timestamp(), 51);
}

#[tokio::test]
async fn test_pointer_at_newest_is_zero_with_summary() {
    let cache = filled_cache(40).await;

    let counts = cache.unread_counts(&HashMap::from([("room".to_string(), id(40))])).await.unwrap();
    let count = &counts["room"];
    assert_eq!(count.unread, Unread::Exact(0));
    assert_eq!(count.count(), 0);

    let summary = count.latest.as_ref().unwrap();
    assert_eq!(summary.message_id, id(40));
    assert_eq!(summary.preview, "message 40");
}

#[tokio::test]
async fn test_pointer_before_horizon_reports_capacity() {
    let cache = filled_cache(250).await;

    let counts = cache.unread_counts(&HashMap::from([("room".to_string(), id(3))])).await.unwrap();
    assert_eq!(counts["room"].unread, Unread::AtLeast(CAPACITY));
    assert_eq!(counts["room"].count(), CAPACITY as i64);
}

#[tokio::test]
async fn test_unread_counts_mixed_conversations() {
    let cache = filled_cache(60).await;
    cache.append(&create_test_message("quiet", 5)).await.unwrap();

    let pointers = HashMap::from([
        ("room".to_string(), id(50)),
        ("quiet".to_string(), id(9)),
        ("empty".to_string(), id(1)),
    ]);
    let counts = cache.unread_counts(&pointers).await.unwrap();

    assert_eq!(counts["room"].unread, Unread::Exact(10));
    assert_eq!(counts["quiet"].unread, Unread::Inconsistent);
    assert_eq!(counts["quiet"].count(), -1);
    assert_eq!(counts["empty"].unread, Unread::Exact(0));
    assert!(counts["empty"].latest.is_none());
}

#[tokio::test]
async fn test_unread_counts_idempotent() {
    let cache = filled_cache(80).await;
    let pointers = HashMap::from([("room".to_string(), id(25))]);

    let first = cache.unread_counts(&pointers).await.unwrap();
    let second = cache.unread_counts(&pointers).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first["room"].unread, Unread::Exact(55));
}
