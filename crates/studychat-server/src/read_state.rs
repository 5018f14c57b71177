//! Read-state flush coordinator.
//!
//! Read pointers (conversation, user -> last read message) accumulate in a
//! concurrent map and are flushed in bulk: broadcast per conversation as
//! read receipts, then persisted in one batched write. A background task
//! flushes on a fixed period, on demand when the map reaches its threshold,
//! and once more at shutdown.
//!
//! At most one flush runs at a time. A flush attempted while another is in
//! progress returns [`FlushOutcome::Skipped`].

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use dashmap::DashMap;
use studychat_proto::{CompositeId, ConversationEvent, IdentifierError, ReadPointer};
use thiserror::Error;
use tokio::{
    sync::Notify,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::ReadStateConfig,
    hub::ConversationSink,
    storage::{Storage, StorageError, run_blocking},
};

/// Errors that can occur while recording or flushing read state
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadStateError {
    /// The message id is not a valid composite id
    #[error("invalid message id: {0}")]
    Identifier(#[from] IdentifierError),

    /// Persisting the flushed pointers failed; they were re-queued
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// What a call to [`ReadStateCoordinator::flush`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Another flush was in progress
    Skipped,
    /// Nothing was pending
    Empty,
    /// Pointers were broadcast and persisted
    Flushed {
        /// Pointers written
        pointers: usize,
        /// Conversations notified
        conversations: usize,
    },
}

type PointerKey = (String, String);

/// Accumulates read pointers and flushes them in bulk.
pub struct ReadStateCoordinator<S: Storage> {
    pending: DashMap<PointerKey, CompositeId>,
    flushing: AtomicBool,
    wake: Notify,
    storage: S,
    sink: Arc<dyn ConversationSink>,
    config: ReadStateConfig,
}

/// Releases the single-flight flag on every exit path.
struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<S: Storage> ReadStateCoordinator<S> {
    /// Create a coordinator.
    pub fn new(storage: S, sink: Arc<dyn ConversationSink>, config: ReadStateConfig) -> Self {
        Self {
            pending: DashMap::new(),
            flushing: AtomicBool::new(false),
            wake: Notify::new(),
            storage,
            sink,
            config,
        }
    }

    /// Record that `user_id` has read `conversation_id` up to `message_id`.
    ///
    /// Replaces any pending pointer for the same user and conversation.
    pub fn record(
        &self,
        conversation_id: &str,
        user_id: &str,
        message_id: &str,
    ) -> Result<(), ReadStateError> {
        let id = CompositeId::from_hex(message_id)?;
        self.pending.insert((conversation_id.to_string(), user_id.to_string()), id);

        if self.pending.len() >= self.config.flush_threshold {
            self.wake.notify_one();
        }
        Ok(())
    }

    /// Pointers waiting for the next flush.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Flush all pending pointers.
    ///
    /// # Errors
    ///
    /// Returns [`ReadStateError::Storage`] if the batched write fails. The
    /// snapshotted pointers are re-queued unless a newer pointer for the same
    /// key arrived in the meantime.
    pub async fn flush(&self) -> Result<FlushOutcome, ReadStateError> {
        if self
            .flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(FlushOutcome::Skipped);
        }
        let _guard = FlushGuard(&self.flushing);

        let snapshot: Vec<(PointerKey, CompositeId)> =
            self.pending.iter().map(|entry| (entry.key().clone(), *entry.value())).collect();
        if snapshot.is_empty() {
            return Ok(FlushOutcome::Empty);
        }

        // Entries overwritten since the snapshot stay for the next flush
        for (key, id) in &snapshot {
            self.pending.remove_if(key, |_, current| current == id);
        }

        let mut grouped: BTreeMap<String, BTreeMap<String, CompositeId>> = BTreeMap::new();
        for ((conversation_id, user_id), id) in &snapshot {
            grouped.entry(conversation_id.clone()).or_default().insert(user_id.clone(), *id);
        }

        let conversations = grouped.len();
        for (conversation_id, pointers) in grouped {
            let event = ConversationEvent::ReadReceipts {
                conversation_id: conversation_id.clone(),
                pointers,
            };
            self.sink.send_to_conversation(&conversation_id, event);
        }

        let pointers: Vec<ReadPointer> = snapshot
            .iter()
            .map(|((conversation_id, user_id), id)| ReadPointer {
                conversation_id: conversation_id.clone(),
                user_id: user_id.clone(),
                message_id: *id,
            })
            .collect();

        if let Err(e) = run_blocking(&self.storage, move |s| s.store_read_pointers(&pointers)).await
        {
            tracing::error!(
                pointers = snapshot.len(),
                error = %e,
                "Failed to persist read pointers, re-queueing"
            );
            for (key, id) in snapshot {
                self.pending.entry(key).or_insert(id);
            }
            return Err(e.into());
        }

        tracing::debug!(pointers = snapshot.len(), conversations, "Flushed read pointers");
        Ok(FlushOutcome::Flushed { pointers: snapshot.len(), conversations })
    }

    /// Background flush loop.
    ///
    /// Flushes every `flush_interval` while pointers are pending and whenever
    /// [`record`](Self::record) reports the threshold reached. On cancellation
    /// it drains what is left and returns.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if self.pending.is_empty() {
                        continue;
                    }
                },
                () = self.wake.notified() => {},
            }

            if let Err(e) = self.flush().await {
                tracing::warn!(error = %e, "Read-state flush failed");
            }
        }

        self.drain().await;
        tracing::info!("Read-state coordinator stopped");
    }

    async fn drain(&self) {
        loop {
            match self.flush().await {
                Ok(FlushOutcome::Skipped) => tokio::task::yield_now().await,
                Ok(_) => break,
                Err(e) => {
                    tracing::error!(
                        pending = self.pending.len(),
                        error = %e,
                        "Final read-state flush failed"
                    );
                    break;
                },
            }
        }
    }
}
