//! Composite id generation.
//!
//! One [`IdSequencer`] per producer shard. Ids come out strictly increasing in
//! both raw and cache-key order, so the cache and the durable log see messages
//! from one producer in the order they were created.
//!
//! Flow: read the clock, compare with the last issued id, pick the next
//! (timestamp, sequence) pair, publish it with a compare-and-swap. Losers of
//! the race retry against the new last id.

use std::sync::atomic::{AtomicU64, Ordering};

use studychat_proto::{
    CompositeId,
    id::{ID_EPOCH_MILLIS, MAX_SEQUENCE, MAX_SHARD, SEQUENCE_BITS, SHARD_BITS},
};
use thiserror::Error;

use crate::env::Environment;

/// No id issued yet. Never a valid raw id (the layout is 54 bits wide).
const NONE_ISSUED: u64 = u64::MAX;

/// Errors that can occur while issuing ids
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SequencerError {
    /// Shard id does not fit the 4-bit field
    #[error("shard {0} out of range (max 15)")]
    InvalidShard(u8),

    /// Wall clock reads earlier than the id epoch
    #[error("clock reads {0} ms, before the id epoch")]
    ClockBeforeEpoch(u64),

    /// Timestamp field exhausted
    #[error("timestamp space exhausted")]
    Exhausted,
}

/// Lock-free generator of composite ids for one shard.
#[derive(Debug)]
pub struct IdSequencer<E: Environment> {
    env: E,
    shard: u8,
    /// Raw value of the last issued id, or `NONE_ISSUED`
    last: AtomicU64,
}

impl<E: Environment> IdSequencer<E> {
    /// Create a sequencer for `shard` (0..=15).
    pub fn new(env: E, shard: u8) -> Result<Self, SequencerError> {
        if shard > MAX_SHARD {
            return Err(SequencerError::InvalidShard(shard));
        }
        Ok(Self { env, shard, last: AtomicU64::new(NONE_ISSUED) })
    }

    /// Shard embedded in every issued id.
    pub fn shard(&self) -> u8 {
        self.shard
    }

    /// Issue the next id.
    ///
    /// # Invariants
    ///
    /// - Post: the returned id is greater than every id previously returned by
    ///   this sequencer, including when the clock moves backwards
    /// - Post: within one millisecond the sequence field increments; after
    ///   the 512th id the timestamp advances past the clock
    pub fn next_id(&self) -> Result<CompositeId, SequencerError> {
        let now = self.env.wall_clock_millis();
        let now = now.checked_sub(ID_EPOCH_MILLIS).ok_or(SequencerError::ClockBeforeEpoch(now))?;

        let mut last = self.last.load(Ordering::Acquire);
        loop {
            let (timestamp, sequence) = if last == NONE_ISSUED {
                (now, 0)
            } else {
                let last_timestamp = last >> (SHARD_BITS + SEQUENCE_BITS);
                let last_sequence = (last & u64::from(MAX_SEQUENCE)) as u16;

                if now > last_timestamp {
                    (now, 0)
                } else if last_sequence < MAX_SEQUENCE {
                    (last_timestamp, last_sequence + 1)
                } else {
                    (last_timestamp + 1, 0)
                }
            };

            let id = CompositeId::new(timestamp, self.shard, sequence)
                .map_err(|_| SequencerError::Exhausted)?;

            match self.last.compare_exchange_weak(last, id.raw(), Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    debug_assert!(last == NONE_ISSUED || id.raw() > last);
                    return Ok(id);
                },
                Err(current) => last = current,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::ManualEnv;

    const T0: u64 = ID_EPOCH_MILLIS + 1_000;

    #[test]
    fn test_rejects_invalid_shard() {
        assert_eq!(
            IdSequencer::new(ManualEnv::new(T0), 16).unwrap_err(),
            SequencerError::InvalidShard(16)
        );
    }

    #[test]
    fn test_same_millisecond_increments_sequence() {
        let sequencer = IdSequencer::new(ManualEnv::new(T0), 3).unwrap();

        let a = sequencer.next_id().unwrap();
        let b = sequencer.next_id().unwrap();

        assert_eq!(a.timestamp(), 1_000);
        assert_eq!((a.sequence(), b.sequence()), (0, 1));
        assert_eq!(b.shard(), 3);
    }

    #[test]
    fn test_new_millisecond_resets_sequence() {
        let env = ManualEnv::new(T0);
        let sequencer = IdSequencer::new(env.clone(), 0).unwrap();

        sequencer.next_id().unwrap();
        sequencer.next_id().unwrap();
        env.advance(5);

        let id = sequencer.next_id().unwrap();
        assert_eq!(id.timestamp(), 1_005);
        assert_eq!(id.sequence(), 0);
    }

    #[test]
    fn test_exhausted_sequence_advances_timestamp() {
        let sequencer = IdSequencer::new(ManualEnv::new(T0), 0).unwrap();

        for _ in 0..=MAX_SEQUENCE {
            sequencer.next_id().unwrap();
        }

        let id = sequencer.next_id().unwrap();
        assert_eq!(id.timestamp(), 1_001);
        assert_eq!(id.sequence(), 0);
    }

    #[test]
    fn test_clock_going_backwards_stays_monotonic() {
        let env = ManualEnv::new(T0);
        let sequencer = IdSequencer::new(env.clone(), 0).unwrap();

        let before = sequencer.next_id().unwrap();
        env.set(T0 - 500);
        let after = sequencer.next_id().unwrap();

        assert!(after > before);
        assert!(after.cache_key() > before.cache_key());
    }

    #[test]
    fn test_clock_before_epoch() {
        let sequencer = IdSequencer::new(ManualEnv::new(5), 0).unwrap();
        assert_eq!(sequencer.next_id(), Err(SequencerError::ClockBeforeEpoch(5)));
    }
}
