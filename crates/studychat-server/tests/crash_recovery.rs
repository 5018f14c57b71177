//! Crash recovery tests for `RedbStorage`.
//!
//! These tests verify that messages and read pointers persist across database
//! close/reopen cycles, simulating server restarts.

use studychat_proto::{ChatMessage, CompositeId, MessageType, ReadPointer};
use studychat_server::{
    LatestIndex,
    storage::{Direction, RedbStorage, Storage},
};
use tempfile::tempdir;

fn create_test_message(conversation_id: &str, timestamp: u64) -> ChatMessage {
    let id = CompositeId::new(timestamp, 0, 0).unwrap();
    ChatMessage::new(id, MessageType::Text, conversation_id, "alice", format!("m{timestamp}"))
}

#[test]
fn test_messages_survive_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test.redb");

    // Write messages, then simulate clean shutdown
    {
        let storage = RedbStorage::open(&db_path).unwrap();
        let messages: Vec<_> = (1..=10).map(|t| create_test_message("room", t)).collect();
        assert_eq!(storage.insert_many(&messages).unwrap().len(), 10);
    }

    {
        let storage = RedbStorage::open(&db_path).unwrap();

        let from = CompositeId::new(1, 0, 0).unwrap();
        let messages = storage.range_from("room", from, Direction::OldestFirst, 100).unwrap();
        assert_eq!(messages.len(), 10);
        for (i, message) in messages.iter().enumerate() {
            assert_eq!(message.id.timestamp(), i as u64 + 1);
            assert_eq!(message.content, format!("m{}", i + 1));
        }

        let latest = storage.latest_message("room").unwrap().unwrap();
        assert_eq!(latest.id.timestamp(), 10);
    }
}

#[test]
fn test_duplicates_skipped_after_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test.redb");
    let messages: Vec<_> = (1..=5).map(|t| create_test_message("room", t)).collect();

    {
        let storage = RedbStorage::open(&db_path).unwrap();
        storage.insert_many(&messages).unwrap();
    }

    {
        let storage = RedbStorage::open(&db_path).unwrap();
        let mut replay = messages.clone();
        replay.push(create_test_message("room", 6));

        let inserted = storage.insert_many(&replay).unwrap();
        assert_eq!(inserted.len(), 1);
        assert_eq!(inserted[0].id.timestamp(), 6);
    }
}

#[test]
fn test_read_pointers_survive_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test.redb");
    let id = CompositeId::new(42, 3, 7).unwrap();

    {
        let storage = RedbStorage::open(&db_path).unwrap();
        storage
            .store_read_pointers(&[
                ReadPointer {
                    conversation_id: "room".to_string(),
                    user_id: "alice".to_string(),
                    message_id: id,
                },
                ReadPointer {
                    conversation_id: "other".to_string(),
                    user_id: "alice".to_string(),
                    message_id: id,
                },
            ])
            .unwrap();
    }

    {
        let storage = RedbStorage::open(&db_path).unwrap();
        let pointers = storage.load_read_pointers("room").unwrap();
        assert_eq!(pointers.len(), 1);
        assert_eq!(pointers.get("alice"), Some(&id));
    }
}

#[tokio::test]
async fn test_latest_index_rebuilt_after_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test.redb");

    {
        let storage = RedbStorage::open(&db_path).unwrap();
        let mut messages: Vec<_> = (1..=3).map(|t| create_test_message("a", t)).collect();
        messages.extend((1..=7).map(|t| create_test_message("b", t)));
        storage.insert_many(&messages).unwrap();
    }

    let storage = RedbStorage::open(&db_path).unwrap();
    let index = LatestIndex::new();
    assert_eq!(index.warm(&storage).await.unwrap(), 2);
    assert_eq!(index.get("a").unwrap().message_id.timestamp(), 3);
    assert_eq!(index.get("b").unwrap().message_id.timestamp(), 7);
}
