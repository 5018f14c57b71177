//! Durable message log.
//!
//! Trait-based abstraction over the store that keeps every chat message and
//! the last flushed read pointers. The trait is synchronous; async callers go
//! through [`run_blocking`] so database work never runs on a runtime worker.
//!
//! Every implementation orders a conversation's messages by
//! [`CacheKey`](studychat_proto::CacheKey), the same order the recency cache
//! uses, so the two never disagree about which message comes first.

mod chaotic;
mod error;
mod memory;
mod redb;

use std::collections::HashMap;

pub use chaotic::ChaoticStorage;
pub use error::StorageError;
pub use memory::MemoryStorage;
use studychat_proto::{ChatMessage, CompositeId, ReadPointer};

pub use self::redb::RedbStorage;

/// Scan direction for [`Storage::range_from`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Ascending key order
    OldestFirst,
    /// Descending key order
    NewestFirst,
}

/// Storage abstraction for chat messages and read pointers
///
/// Must be Clone (shared by the persistence worker, the history reader and
/// the read-state coordinator), Send + Sync, and synchronous. Implementations
/// share internal state via Arc, so clones access the same underlying storage.
pub trait Storage: Clone + Send + Sync + 'static {
    /// Persist a batch of messages.
    ///
    /// Messages whose id is already stored are skipped. Returns the messages
    /// that were actually inserted, in input order.
    ///
    /// # Invariants
    ///
    /// - Post: every returned message is readable by id order afterwards
    /// - Post: a failed call inserts nothing
    fn insert_many(&self, messages: &[ChatMessage]) -> Result<Vec<ChatMessage>, StorageError>;

    /// Messages of a conversation with `from <= id < to`, oldest first.
    ///
    /// Empty when `from >= to`.
    fn range_query(
        &self,
        conversation_id: &str,
        from: CompositeId,
        to: CompositeId,
    ) -> Result<Vec<ChatMessage>, StorageError>;

    /// Up to `limit` messages with `id >= from`.
    ///
    /// `NewestFirst` returns the newest `limit` of them in descending order,
    /// `OldestFirst` the oldest `limit` in ascending order.
    fn range_from(
        &self,
        conversation_id: &str,
        from: CompositeId,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StorageError>;

    /// Newest message of a conversation. `None` if nothing is stored.
    fn latest_message(&self, conversation_id: &str) -> Result<Option<ChatMessage>, StorageError>;

    /// All conversations with at least one message. Order is not guaranteed.
    fn list_conversations(&self) -> Result<Vec<String>, StorageError>;

    /// Persist read pointers in one write, overwriting earlier values.
    fn store_read_pointers(&self, pointers: &[ReadPointer]) -> Result<(), StorageError>;

    /// Stored read pointers of one conversation, keyed by user id.
    fn load_read_pointers(
        &self,
        conversation_id: &str,
    ) -> Result<HashMap<String, CompositeId>, StorageError>;
}

/// Run a storage call on the blocking pool.
pub async fn run_blocking<S, T, F>(storage: &S, f: F) -> Result<T, StorageError>
where
    S: Storage,
    T: Send + 'static,
    F: FnOnce(&S) -> Result<T, StorageError> + Send + 'static,
{
    let storage = storage.clone();
    tokio::task::spawn_blocking(move || f(&storage))
        .await
        .map_err(|e| StorageError::Io(format!("blocking storage task failed: {e}")))?
}
