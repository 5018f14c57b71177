//! Persistence worker.
//!
//! Drains a pipeline subscription into the durable log in batches, bounded by
//! count and by time (whichever comes first). After each durable write the
//! newest message of every touched conversation goes into the latest-message
//! index, then the batch is appended to the recency cache.
//!
//! Delivery is at-most-once: a batch whose durable write fails is logged and
//! dropped, and the loop continues with the next one.
//!
//! Each conversation is assumed to have a single producer shard, so its
//! cache keys only grow. A message that arrives after a newer one of the
//! same conversation was cached (clock skew between shards) is still
//! durable, but the cache rejects it and every rejection is logged with its
//! conversation and id.

use std::sync::Arc;

use studychat_proto::ChatMessage;
use tokio::time::{self, MissedTickBehavior};

use crate::{
    cache::{CacheError, RecencyCache},
    config::BatchConfig,
    latest::LatestIndex,
    pipeline::Subscription,
    storage::{Storage, run_blocking},
};

/// Outcome of writing one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Durable write succeeded
    Persisted {
        /// Messages in the batch
        received: usize,
        /// Messages newly inserted (duplicates skipped)
        inserted: usize,
    },
    /// Durable write failed; the batch was dropped
    Dropped {
        /// Messages lost
        lost: usize,
    },
}

/// Background consumer that batches messages into durable storage.
pub struct PersistWorker<S: Storage> {
    storage: S,
    cache: Arc<dyn RecencyCache>,
    latest: LatestIndex,
    config: BatchConfig,
}

impl<S: Storage> PersistWorker<S> {
    /// Create a worker.
    pub fn new(
        storage: S,
        cache: Arc<dyn RecencyCache>,
        latest: LatestIndex,
        config: BatchConfig,
    ) -> Self {
        Self { storage, cache, latest, config }
    }

    /// Run until the subscription ends, then write the partial batch.
    pub async fn run(self, mut subscription: Subscription) {
        let max_batch = self.config.max_batch.max(1);
        let mut batch: Vec<ChatMessage> = Vec::with_capacity(max_batch);

        let mut ticker = time::interval(self.config.window);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        tracing::info!(
            max_batch,
            window_ms = self.config.window.as_millis() as u64,
            "Persistence worker started"
        );

        loop {
            tokio::select! {
                received = subscription.recv() => match received {
                    Some(message) => {
                        batch.push(message);
                        if batch.len() >= max_batch {
                            self.write_batch(std::mem::take(&mut batch)).await;
                            ticker.reset();
                        }
                    },
                    None => break,
                },
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        self.write_batch(std::mem::take(&mut batch)).await;
                    }
                },
            }
        }

        if !batch.is_empty() {
            self.write_batch(batch).await;
        }
        tracing::info!("Persistence worker stopped");
    }

    /// Persist one batch, then update the latest index and the cache.
    pub async fn write_batch(&self, batch: Vec<ChatMessage>) -> BatchOutcome {
        let received = batch.len();

        let mut inserted = match run_blocking(&self.storage, move |s| s.insert_many(&batch)).await {
            Ok(inserted) => inserted,
            Err(e) => {
                tracing::error!(
                    batch_size = received,
                    error = %e,
                    "Durable write failed, dropping batch"
                );
                return BatchOutcome::Dropped { lost: received };
            },
        };

        self.latest.record_batch(&inserted);

        inserted.sort_by_key(ChatMessage::cache_key);
        match self.cache.append_batch(&inserted).await {
            Ok(()) => {},
            Err(CacheError::Partial { failures }) => {
                for (message_id, error) in &failures {
                    tracing::warn!(
                        message_id = %message_id,
                        error = %error,
                        "Message left out of recency cache"
                    );
                }
            },
            Err(e) => {
                tracing::warn!(
                    batch_size = inserted.len(),
                    error = %e,
                    "Recency cache append failed"
                );
            },
        }

        tracing::debug!(received, inserted = inserted.len(), "Batch persisted");
        BatchOutcome::Persisted { received, inserted: inserted.len() }
    }
}
