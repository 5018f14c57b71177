//! Server error types.

use std::fmt;

use crate::{
    cache::CacheError, history::HistoryError, read_state::ReadStateError,
    sequencer::SequencerError, storage::StorageError,
};

/// Errors surfaced by the chat service and the binary.
#[derive(Debug)]
pub enum ServerError {
    /// Configuration error (bad shard id, unreadable database path, etc.).
    ///
    /// Fatal: prevents startup. Fix configuration and restart.
    Config(String),

    /// Durable log failure.
    ///
    /// Usually transient (I/O). Serialization errors indicate corruption.
    Storage(StorageError),

    /// Recency cache failure.
    ///
    /// The cache is best-effort; callers that can fall back to the durable log
    /// do so instead of surfacing this.
    Cache(CacheError),

    /// Id generation failed (clock before epoch, exhausted timestamp space).
    Sequencer(SequencerError),

    /// History read failed.
    History(HistoryError),

    /// Read-state flush or record failed.
    ReadState(ReadStateError),

    /// Internal error (background task panicked, etc.).
    ///
    /// Indicates a bug.
    Internal(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::Storage(err) => write!(f, "storage error: {err}"),
            Self::Cache(err) => write!(f, "cache error: {err}"),
            Self::Sequencer(err) => write!(f, "sequencer error: {err}"),
            Self::History(err) => write!(f, "history error: {err}"),
            Self::ReadState(err) => write!(f, "read state error: {err}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(err) => Some(err),
            Self::Cache(err) => Some(err),
            Self::Sequencer(err) => Some(err),
            Self::History(err) => Some(err),
            Self::ReadState(err) => Some(err),
            Self::Config(_) | Self::Internal(_) => None,
        }
    }
}

impl From<StorageError> for ServerError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err)
    }
}

impl From<CacheError> for ServerError {
    fn from(err: CacheError) -> Self {
        Self::Cache(err)
    }
}

impl From<SequencerError> for ServerError {
    fn from(err: SequencerError) -> Self {
        Self::Sequencer(err)
    }
}

impl From<HistoryError> for ServerError {
    fn from(err: HistoryError) -> Self {
        Self::History(err)
    }
}

impl From<ReadStateError> for ServerError {
    fn from(err: ReadStateError) -> Self {
        Self::ReadState(err)
    }
}
