//! Fuzz target for the durable log under storage failures
//!
//! Drives `ChaoticStorage<MemoryStorage>` with arbitrary batches and reads,
//! tracking which writes succeeded in a model.
//!
//! # Strategy
//!
//! - Variable failure rates (0% to 90%)
//! - Batches with duplicate and out-of-order ids, across a few conversations
//! - Interleaved range reads and read-pointer writes
//!
//! # Invariants
//!
//! - Storage NEVER panics on injected errors
//! - A failed batch inserts nothing
//! - The log of every conversation equals the model, in ascending key order

#![no_main]

use std::collections::{BTreeMap, HashMap};

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use studychat_proto::{CacheKey, ChatMessage, CompositeId, MessageType, ReadPointer};
use studychat_server::{ChaoticStorage, Direction, MemoryStorage, Storage};

#[derive(Debug, Clone, Arbitrary)]
struct ChaosScenario {
    /// Seed for ChaoticStorage RNG (deterministic failures)
    chaos_seed: u64,
    /// Failure rate 0-9 maps to 0%-90%
    failure_rate_tenth: u8,
    /// Sequence of operations to perform
    operations: Vec<ChaosOperation>,
}

#[derive(Debug, Clone, Arbitrary)]
enum ChaosOperation {
    /// Insert a batch of (conversation, timestamp, sequence) messages
    InsertBatch { messages: Vec<(u8, u16, u8)> },
    /// Range read from a timestamp
    RangeFrom { conversation: u8, from: u16, newest_first: bool, limit: u8 },
    /// Half-open range read
    RangeQuery { conversation: u8, from: u16, to: u16 },
    /// Write a read pointer
    StorePointer { conversation: u8, user: u8, timestamp: u16 },
}

fn conversation(n: u8) -> String {
    format!("conv-{}", n % 4)
}

fn message_id(timestamp: u16, sequence: u8) -> CompositeId {
    CompositeId::new(u64::from(timestamp), 0, u16::from(sequence)).expect("fields in range")
}

fuzz_target!(|scenario: ChaosScenario| {
    let failure_rate = (scenario.failure_rate_tenth % 10) as f64 / 10.0;
    let storage =
        ChaoticStorage::with_seed(MemoryStorage::new(), failure_rate, scenario.chaos_seed);

    let mut model: HashMap<String, BTreeMap<CacheKey, ChatMessage>> = HashMap::new();

    for operation in scenario.operations.into_iter().take(64) {
        match operation {
            ChaosOperation::InsertBatch { messages } => {
                let batch: Vec<ChatMessage> = messages
                    .into_iter()
                    .take(32)
                    .map(|(c, timestamp, sequence)| {
                        ChatMessage::new(
                            message_id(timestamp, sequence),
                            MessageType::Text,
                            conversation(c),
                            "fuzzer",
                            "payload",
                        )
                    })
                    .collect();

                if let Ok(inserted) = storage.insert_many(&batch) {
                    for message in inserted {
                        let log = model.entry(message.conversation_id.clone()).or_default();
                        assert!(
                            log.insert(message.cache_key(), message).is_none(),
                            "duplicate reported as inserted"
                        );
                    }
                }
            },
            ChaosOperation::RangeFrom { conversation: c, from, newest_first, limit } => {
                let direction =
                    if newest_first { Direction::NewestFirst } else { Direction::OldestFirst };
                if let Ok(messages) =
                    storage.range_from(&conversation(c), message_id(from, 0), direction, limit.into())
                {
                    assert!(messages.len() <= usize::from(limit));
                    let ordered = messages.windows(2).all(|pair| match direction {
                        Direction::OldestFirst => pair[0].cache_key() < pair[1].cache_key(),
                        Direction::NewestFirst => pair[0].cache_key() > pair[1].cache_key(),
                    });
                    assert!(ordered, "range_from out of order");
                }
            },
            ChaosOperation::RangeQuery { conversation: c, from, to } => {
                let (from, to) = (message_id(from, 0), message_id(to, 0));
                if let Ok(messages) = storage.range_query(&conversation(c), from, to) {
                    for message in &messages {
                        assert!(message.cache_key() >= from.cache_key());
                        assert!(message.cache_key() < to.cache_key());
                    }
                }
            },
            ChaosOperation::StorePointer { conversation: c, user, timestamp } => {
                let pointer = ReadPointer {
                    conversation_id: conversation(c),
                    user_id: format!("user-{user}"),
                    message_id: message_id(timestamp, 0),
                };
                let _ = storage.store_read_pointers(&[pointer]);
            },
        }
    }

    // Failed batches left no trace
    for (conversation_id, expected) in &model {
        let stored = storage
            .inner()
            .range_from(conversation_id, message_id(0, 0), Direction::OldestFirst, usize::MAX)
            .expect("inner storage never fails");
        let expected: Vec<&ChatMessage> = expected.values().collect();
        let stored: Vec<&ChatMessage> = stored.iter().collect();
        assert_eq!(stored, expected);
    }
});
