//! Ingestion pipeline.
//!
//! Multicast of newly produced messages to independent consumers (the
//! persistence worker, the live fan-out). Every subscriber owns a bounded
//! buffer. `publish` never waits: when a subscriber's buffer is full the
//! incoming message is dropped for that subscriber and the drop is logged and
//! counted. Durability of a dropped message is not guaranteed by the
//! pipeline.

#![allow(clippy::disallowed_types, reason = "Lock is never held across an await")]

use std::sync::{
    Arc, PoisonError, RwLock,
    atomic::{AtomicU64, Ordering},
};

use studychat_proto::ChatMessage;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Counters for observing silent loss.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Messages accepted by `publish`
    pub published: u64,
    /// Per-subscriber deliveries dropped (full buffer or closed pipeline)
    pub dropped: u64,
}

/// Multicast channel with bounded per-subscriber buffers.
///
/// Clone is cheap; clones share the same subscribers.
#[derive(Clone)]
pub struct IngestPipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    capacity: usize,
    /// `None` once closed
    subscribers: RwLock<Option<Vec<mpsc::Sender<ChatMessage>>>>,
    published: AtomicU64,
    dropped: AtomicU64,
}

/// Receiving end of one subscriber.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<ChatMessage>,
}

impl Subscription {
    /// Next message, or `None` once the pipeline is closed and the buffer is
    /// drained. Cancel safe.
    pub async fn recv(&mut self) -> Option<ChatMessage> {
        self.rx.recv().await
    }
}

impl IngestPipeline {
    /// Pipeline whose subscribers buffer up to `capacity` messages each.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                capacity: capacity.max(1),
                subscribers: RwLock::new(Some(Vec::new())),
                published: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Attach a consumer. It receives every message published from now on.
    ///
    /// After `close` the returned subscription is already finished.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.inner.capacity);

        let mut subscribers =
            self.inner.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(subscribers) = subscribers.as_mut() {
            subscribers.push(tx);
        }

        Subscription { rx }
    }

    /// Offer a message to every subscriber without waiting.
    ///
    /// Returns the number of subscribers that accepted it.
    pub fn publish(&self, message: ChatMessage) -> usize {
        let mut delivered = 0;
        let mut saw_closed = false;

        {
            let subscribers = self.inner.subscribers.read().unwrap_or_else(PoisonError::into_inner);
            let Some(subscribers) = subscribers.as_ref() else {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    conversation_id = %message.conversation_id,
                    message_id = %message.id,
                    "Publish after pipeline close, message dropped"
                );
                return 0;
            };

            self.inner.published.fetch_add(1, Ordering::Relaxed);

            for tx in subscribers {
                match tx.try_send(message.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(dropped)) => {
                        self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            conversation_id = %dropped.conversation_id,
                            message_id = %dropped.id,
                            capacity = self.inner.capacity,
                            "Subscriber buffer full, message dropped"
                        );
                    },
                    Err(TrySendError::Closed(_)) => saw_closed = true,
                }
            }
        }

        if saw_closed {
            let mut subscribers =
                self.inner.subscribers.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(subscribers) = subscribers.as_mut() {
                subscribers.retain(|tx| !tx.is_closed());
            }
        }

        delivered
    }

    /// Stop accepting messages. Subscribers drain what is buffered and then
    /// see the end of the stream.
    pub fn close(&self) {
        let mut subscribers = self.inner.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(closed) = subscribers.take() {
            tracing::info!(subscribers = closed.len(), "Ingestion pipeline closed");
        }
    }

    /// Live subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, Vec::len)
    }

    /// Published / dropped counters.
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            published: self.inner.published.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
        }
    }
}
