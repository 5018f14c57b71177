//! Composite message identifiers and their cache-key encoding.
//!
//! A message id is a 64-bit value with the layout
//!
//! ```text
//! [ 41-bit timestamp since ID_EPOCH_MILLIS ][ 4-bit shard ][ 9-bit sequence ]
//! ```
//!
//! packed as `timestamp << 13 | shard << 9 | sequence`. On the wire it is a
//! lowercase hex string.
//!
//! The recency cache and the durable log key entries by a [`CacheKey`]
//! instead: `millis-(sequence << 4 | shard)`, where `millis` is the absolute
//! Unix millisecond. That pair is ordered numerically on both components,
//! which is also the native ordering of a Redis stream id. For ids issued by
//! one producer, cache-key order equals generation order.

use std::{cmp::Ordering, fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use thiserror::Error;

/// Custom epoch of the timestamp field (2023-01-01T00:00:00Z, Unix millis).
pub const ID_EPOCH_MILLIS: u64 = 1_672_531_200_000;

/// Width of the timestamp field.
pub const TIMESTAMP_BITS: u32 = 41;

/// Width of the shard (producer) field.
pub const SHARD_BITS: u32 = 4;

/// Width of the intra-millisecond sequence field.
pub const SEQUENCE_BITS: u32 = 9;

/// Largest timestamp (milliseconds since [`ID_EPOCH_MILLIS`]).
pub const MAX_TIMESTAMP: u64 = (1 << TIMESTAMP_BITS) - 1;

/// Largest shard id.
pub const MAX_SHARD: u8 = (1 << SHARD_BITS) - 1;

/// Largest sequence number within one millisecond.
pub const MAX_SEQUENCE: u16 = (1 << SEQUENCE_BITS) - 1;

const SHARD_SHIFT: u32 = SEQUENCE_BITS;
const TIMESTAMP_SHIFT: u32 = SHARD_BITS + SEQUENCE_BITS;
const LAYOUT_BITS: u32 = TIMESTAMP_BITS + SHARD_BITS + SEQUENCE_BITS;

/// Errors produced while decoding identifiers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentifierError {
    /// Input is not a well-formed identifier (empty, non-hex, bad separator).
    #[error("malformed identifier {raw:?}: {reason}")]
    Malformed {
        /// The offending input
        raw: String,
        /// What was wrong with it
        reason: &'static str,
    },

    /// Input decodes to a value that does not fit the 54-bit layout.
    #[error("identifier {raw:?} overflows the 54-bit layout")]
    Overflow {
        /// The offending input
        raw: String,
    },

    /// A single field is outside its bit width.
    #[error("{field} {value} out of range (max {max})")]
    OutOfRange {
        /// Field name
        field: &'static str,
        /// Supplied value
        value: u64,
        /// Largest allowed value
        max: u64,
    },
}

/// Time-ordered, globally unique message id.
///
/// Construction validates the bit layout, so every `CompositeId` has a valid
/// [`CacheKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompositeId(u64);

impl CompositeId {
    /// Pack the three fields into an id.
    pub fn new(timestamp: u64, shard: u8, sequence: u16) -> Result<Self, IdentifierError> {
        if timestamp > MAX_TIMESTAMP {
            return Err(IdentifierError::OutOfRange {
                field: "timestamp",
                value: timestamp,
                max: MAX_TIMESTAMP,
            });
        }
        if shard > MAX_SHARD {
            return Err(IdentifierError::OutOfRange {
                field: "shard",
                value: u64::from(shard),
                max: u64::from(MAX_SHARD),
            });
        }
        if sequence > MAX_SEQUENCE {
            return Err(IdentifierError::OutOfRange {
                field: "sequence",
                value: u64::from(sequence),
                max: u64::from(MAX_SEQUENCE),
            });
        }

        Ok(Self(
            timestamp << TIMESTAMP_SHIFT | u64::from(shard) << SHARD_SHIFT | u64::from(sequence),
        ))
    }

    /// Wrap an already packed value.
    pub fn from_raw(raw: u64) -> Result<Self, IdentifierError> {
        if raw >> LAYOUT_BITS != 0 {
            return Err(IdentifierError::Overflow { raw: format!("{raw:x}") });
        }
        Ok(Self(raw))
    }

    /// Decode the hex wire form.
    ///
    /// Accepts ASCII hex digits only (no sign, no `0x` prefix). Leading zeros
    /// are allowed.
    pub fn from_hex(raw: &str) -> Result<Self, IdentifierError> {
        if raw.is_empty() {
            return Err(IdentifierError::Malformed { raw: String::new(), reason: "empty" });
        }
        if !raw.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(IdentifierError::Malformed {
                raw: raw.to_string(),
                reason: "not hexadecimal",
            });
        }

        let digits = raw.trim_start_matches('0');
        if digits.len() > 16 {
            return Err(IdentifierError::Overflow { raw: raw.to_string() });
        }
        if digits.is_empty() {
            return Ok(Self(0));
        }

        let value = u64::from_str_radix(digits, 16)
            .map_err(|_| IdentifierError::Overflow { raw: raw.to_string() })?;

        Self::from_raw(value).map_err(|_| IdentifierError::Overflow { raw: raw.to_string() })
    }

    /// Packed 64-bit value.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Milliseconds since [`ID_EPOCH_MILLIS`].
    pub const fn timestamp(self) -> u64 {
        self.0 >> TIMESTAMP_SHIFT
    }

    /// Absolute Unix milliseconds.
    pub const fn unix_millis(self) -> u64 {
        self.timestamp() + ID_EPOCH_MILLIS
    }

    /// Producer shard.
    pub const fn shard(self) -> u8 {
        ((self.0 >> SHARD_SHIFT) & MAX_SHARD as u64) as u8
    }

    /// Sequence within the millisecond.
    pub const fn sequence(self) -> u16 {
        (self.0 & MAX_SEQUENCE as u64) as u16
    }

    /// Re-encode as the key used by the cache and the durable log.
    pub const fn cache_key(self) -> CacheKey {
        CacheKey {
            millis: self.unix_millis(),
            sequence: self.sequence() << SHARD_BITS | self.shard() as u16,
        }
    }
}

impl fmt::Display for CompositeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl FromStr for CompositeId {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for CompositeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CompositeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::from_hex(&raw).map_err(de::Error::custom)
    }
}

/// Ordered key of a cache or log entry: `millis-(sequence << 4 | shard)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    millis: u64,
    sequence: u16,
}

impl CacheKey {
    /// Smallest possible key.
    pub const MIN: Self = Self { millis: 0, sequence: 0 };

    /// Largest possible key.
    pub const MAX: Self = Self { millis: u64::MAX, sequence: u16::MAX };

    /// Build a key from its two components.
    pub const fn new(millis: u64, sequence: u16) -> Self {
        Self { millis, sequence }
    }

    /// Absolute Unix milliseconds component.
    pub const fn millis(self) -> u64 {
        self.millis
    }

    /// Packed `sequence << 4 | shard` component.
    pub const fn sequence(self) -> u16 {
        self.sequence
    }

    /// Recover the composite id this key was derived from.
    pub fn to_composite(self) -> Result<CompositeId, IdentifierError> {
        let timestamp = self.millis.checked_sub(ID_EPOCH_MILLIS).ok_or(
            IdentifierError::OutOfRange {
                field: "millis",
                value: self.millis,
                max: ID_EPOCH_MILLIS + MAX_TIMESTAMP,
            },
        )?;
        let shard = (self.sequence & u16::from(MAX_SHARD)) as u8;
        let sequence = self.sequence >> SHARD_BITS;

        CompositeId::new(timestamp, shard, sequence)
    }
}

/// Compare two cache keys: timestamp first, then the sequence component.
///
/// Both components compare numerically. Comparing the sequence component as
/// text would misorder `"10"` and `"9"` whenever digit widths differ.
pub fn compare(a: &CacheKey, b: &CacheKey) -> Ordering {
    a.millis.cmp(&b.millis).then(a.sequence.cmp(&b.sequence))
}

impl Ord for CacheKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare(self, other)
    }
}

impl PartialOrd for CacheKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.sequence)
    }
}

impl FromStr for CacheKey {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = |reason| IdentifierError::Malformed { raw: s.to_string(), reason };

        let (millis, sequence) = s.split_once('-').ok_or_else(|| malformed("missing '-'"))?;
        if millis.is_empty() || !millis.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed("millis is not decimal"));
        }
        if sequence.is_empty() || !sequence.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed("sequence is not decimal"));
        }

        let millis = millis.parse().map_err(|_| IdentifierError::Overflow { raw: s.to_string() })?;
        let sequence =
            sequence.parse().map_err(|_| IdentifierError::Overflow { raw: s.to_string() })?;

        Ok(Self { millis, sequence })
    }
}

/// Convert a hex message id straight into its cache key.
pub fn encode(raw_id: &str) -> Result<CacheKey, IdentifierError> {
    Ok(CompositeId::from_hex(raw_id)?.cache_key())
}
