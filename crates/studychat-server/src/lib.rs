//! Studychat server.
//!
//! Message pipeline behind the chat endpoints: messages fan out to a durable
//! log, a bounded per-conversation recency cache and live subscribers; history
//! reads merge the cache with the durable log; read pointers are batched and
//! flushed by a single-flight coordinator.
//!
//! # Components
//!
//! - [`IngestPipeline`]: non-blocking fan-out to every consumer
//! - [`PersistWorker`]: batched writes into [`Storage`], then the cache
//! - [`RecencyCache`]: last `N` messages per conversation ([`MemoryCache`],
//!   [`RedisCache`])
//! - [`HistoryReader`]: cache-first history with durable fallback
//! - [`ReadStateCoordinator`]: batched read-pointer flushes
//! - [`ConversationHub`]: live per-conversation broadcast
//! - [`ChatService`]: owns the above and their background tasks

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod config;
pub mod env;
mod error;
pub mod history;
pub mod hub;
mod latest;
pub mod persist;
pub mod pipeline;
pub mod read_state;
pub mod sequencer;
mod service;
pub mod storage;
mod system_env;

pub use cache::{
    CacheError, MemoryCache, ProbeWindow, RecencyCache, RedisCache, Unread, UnreadCount,
};
pub use config::{BatchConfig, CacheConfig, ChatConfig, ReadStateConfig};
pub use env::{Environment, ManualEnv};
pub use error::ServerError;
pub use history::{HistoryError, HistoryReader};
pub use hub::{ConversationHub, ConversationSink};
pub use latest::LatestIndex;
pub use persist::{BatchOutcome, PersistWorker};
pub use pipeline::{IngestPipeline, PipelineStats, Subscription};
pub use read_state::{FlushOutcome, ReadStateCoordinator, ReadStateError};
pub use sequencer::{IdSequencer, SequencerError};
pub use service::ChatService;
pub use storage::{ChaoticStorage, Direction, MemoryStorage, RedbStorage, Storage, StorageError};
pub use system_env::SystemEnv;
