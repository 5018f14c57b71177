//! Pipeline configuration.

use std::time::Duration;

/// Recency cache sizing.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Soft cap `N` on entries per conversation
    pub capacity: usize,
    /// Entries a conversation may hold above `capacity` before trimming runs
    pub trim_slack: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 100, trim_slack: 16 }
    }
}

/// Persistence worker batching.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Flush once this many messages are buffered
    pub max_batch: usize,
    /// Flush a non-empty batch at least this often
    pub window: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { max_batch: 512, window: Duration::from_millis(500) }
    }
}

/// Read-state flush coordination.
#[derive(Debug, Clone)]
pub struct ReadStateConfig {
    /// Pending pointers that trigger an eager flush
    pub flush_threshold: usize,
    /// Periodic flush interval
    pub flush_interval: Duration,
}

impl Default for ReadStateConfig {
    fn default() -> Self {
        Self { flush_threshold: 1024, flush_interval: Duration::from_millis(500) }
    }
}

/// Chat service configuration
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Recency cache sizing
    pub cache: CacheConfig,
    /// Persistence batching
    pub batch: BatchConfig,
    /// Read-state flushing
    pub read_state: ReadStateConfig,
    /// Producer shard embedded in issued ids (0..=15)
    pub shard_id: u8,
    /// Per-subscriber buffer of the ingestion pipeline
    pub ingest_capacity: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            batch: BatchConfig::default(),
            read_state: ReadStateConfig::default(),
            shard_id: 0,
            ingest_capacity: 10_000,
        }
    }
}
