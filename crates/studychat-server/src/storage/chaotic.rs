//! Chaotic storage wrapper for fault injection testing
//!
//! Storage wrapper that randomly fails operations so tests can check how the
//! persistence worker and the read-state coordinator behave when the durable
//! log is unavailable.

#![allow(clippy::disallowed_types, reason = "Locking simple RNG state")]

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use studychat_proto::{ChatMessage, CompositeId, ReadPointer};

use super::{Direction, Storage, StorageError};

/// Chaotic storage wrapper that randomly injects failures
///
/// Delegates to an underlying storage implementation but fails operations
/// with the configured probability. A failed operation never reaches the
/// inner storage, so a failed write leaves no partial state behind.
#[derive(Clone)]
pub struct ChaoticStorage<S: Storage> {
    inner: S,
    /// Failure rate (0.0 = never fail, 1.0 = always fail)
    failure_rate: f64,
    /// RNG state for deterministic chaos
    rng: Arc<Mutex<ChaoticRng>>,
    /// Operation counter
    operation_count: Arc<AtomicUsize>,
}

/// Linear congruential generator, reproducible for a given seed.
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Next value in [0.0, 1.0)
    fn next(&mut self) -> f64 {
        // Numerical Recipes constants
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }
}

impl<S: Storage> ChaoticStorage<S> {
    /// Create a new chaotic storage wrapper
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, 0x1234_5678_9ABC_DEF0)
    }

    /// Create with explicit seed for reproducible chaos
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
        );

        Self {
            inner,
            failure_rate,
            rng: Arc::new(Mutex::new(ChaoticRng::new(seed))),
            operation_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Underlying storage (for checking invariants after chaos).
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Total number of storage operations attempted.
    pub fn operation_count(&self) -> usize {
        self.operation_count.load(Ordering::Relaxed)
    }

    /// Count the operation and decide whether it fails.
    fn inject(&self, operation: &'static str) -> Result<(), StorageError> {
        self.operation_count.fetch_add(1, Ordering::Relaxed);

        #[allow(clippy::expect_used)]
        let roll = self.rng.lock().expect("ChaoticRng mutex poisoned").next();
        if roll < self.failure_rate {
            return Err(StorageError::Io(format!("chaotic failure injection: {operation}")));
        }
        Ok(())
    }
}

impl<S: Storage> Storage for ChaoticStorage<S> {
    fn insert_many(&self, messages: &[ChatMessage]) -> Result<Vec<ChatMessage>, StorageError> {
        self.inject("insert_many")?;
        self.inner.insert_many(messages)
    }

    fn range_query(
        &self,
        conversation_id: &str,
        from: CompositeId,
        to: CompositeId,
    ) -> Result<Vec<ChatMessage>, StorageError> {
        self.inject("range_query")?;
        self.inner.range_query(conversation_id, from, to)
    }

    fn range_from(
        &self,
        conversation_id: &str,
        from: CompositeId,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StorageError> {
        self.inject("range_from")?;
        self.inner.range_from(conversation_id, from, direction, limit)
    }

    fn latest_message(&self, conversation_id: &str) -> Result<Option<ChatMessage>, StorageError> {
        self.inject("latest_message")?;
        self.inner.latest_message(conversation_id)
    }

    fn list_conversations(&self) -> Result<Vec<String>, StorageError> {
        self.inject("list_conversations")?;
        self.inner.list_conversations()
    }

    fn store_read_pointers(&self, pointers: &[ReadPointer]) -> Result<(), StorageError> {
        self.inject("store_read_pointers")?;
        self.inner.store_read_pointers(pointers)
    }

    fn load_read_pointers(
        &self,
        conversation_id: &str,
    ) -> Result<HashMap<String, CompositeId>, StorageError> {
        self.inject("load_read_pointers")?;
        self.inner.load_read_pointers(conversation_id)
    }
}
