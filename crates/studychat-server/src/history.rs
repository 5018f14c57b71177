//! Chat log reader.
//!
//! Serves history newest-first by combining the recency cache with the
//! durable log:
//!
//! 1. Read the cache from `from_id` onward.
//! 2. Nothing cached: read the durable log instead (newest first, capped at
//!    the cache capacity) and write the result back into the cache.
//! 3. Cache window starts after `from_id`: append the durable range
//!    `[from_id, oldest cached)` so the boundary has no gap and no duplicate.
//! 4. Cache window reaches `from_id`: the cache alone answers.
//!
//! A failing cache degrades to durable-only reads.

use std::sync::Arc;

use studychat_proto::{ChatMessage, CompositeId, IdentifierError};
use thiserror::Error;

use crate::{
    cache::RecencyCache,
    storage::{Direction, Storage, StorageError, run_blocking},
};

/// Errors that can occur while reading history
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HistoryError {
    /// `from_id` is not a valid message id
    #[error("invalid from id: {0}")]
    Identifier(#[from] IdentifierError),

    /// Durable log read failed
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Cache-first history reader.
pub struct HistoryReader<S: Storage> {
    storage: S,
    cache: Arc<dyn RecencyCache>,
}

impl<S: Storage> HistoryReader<S> {
    /// Create a reader.
    pub fn new(storage: S, cache: Arc<dyn RecencyCache>) -> Self {
        Self { storage, cache }
    }

    /// Messages of a conversation with id `>= from_id`, newest first.
    pub async fn get_history(
        &self,
        conversation_id: &str,
        from_id: &str,
    ) -> Result<Vec<ChatMessage>, HistoryError> {
        let from = CompositeId::from_hex(from_id)?;
        let capacity = self.cache.capacity();

        let cached = match self.cache.since(conversation_id, from.cache_key()).await {
            Ok(cached) => cached,
            Err(e) => {
                tracing::warn!(
                    conversation_id,
                    error = %e,
                    "Recency cache read failed, reading durable log only"
                );
                return self.durable_newest(conversation_id, from, capacity).await;
            },
        };

        let Some(oldest) = cached.last() else {
            let messages = self.durable_newest(conversation_id, from, capacity).await?;
            self.fill_cache(conversation_id, &messages).await;
            return Ok(messages);
        };

        if oldest.cache_key() <= from.cache_key() {
            return Ok(cached);
        }

        let oldest_cached = oldest.id;
        let owned_id = conversation_id.to_string();
        let older = run_blocking(&self.storage, move |s| {
            s.range_query(&owned_id, from, oldest_cached)
        })
        .await?;

        tracing::debug!(
            conversation_id,
            cached = cached.len(),
            durable = older.len(),
            "Merged cache window with durable range"
        );

        let mut merged = cached;
        merged.extend(older.into_iter().rev());
        Ok(merged)
    }

    async fn durable_newest(
        &self,
        conversation_id: &str,
        from: CompositeId,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, HistoryError> {
        let owned_id = conversation_id.to_string();
        let messages = run_blocking(&self.storage, move |s| {
            s.range_from(&owned_id, from, Direction::NewestFirst, limit)
        })
        .await?;
        Ok(messages)
    }

    /// Read-through fill, oldest first so the cache log stays in order.
    async fn fill_cache(&self, conversation_id: &str, newest_first: &[ChatMessage]) {
        if newest_first.is_empty() {
            return;
        }

        let chronological: Vec<ChatMessage> = newest_first.iter().rev().cloned().collect();
        if let Err(e) = self.cache.append_batch(&chronological).await {
            tracing::debug!(conversation_id, error = %e, "Cache fill incomplete");
        }
    }
}
