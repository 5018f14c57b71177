//! Data model for the studychat message pipeline.
//!
//! Pure types with no I/O: the composite message identifier and its cache-key
//! codec ([`id`]), the immutable [`ChatMessage`] record and its summary
//! ([`message`]), and the events pushed to live subscribers ([`event`]).
//!
//! The server crate builds the cache, the durable log and the background
//! workers on top of these types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod event;
pub mod id;
pub mod message;

pub use event::{ConversationEvent, ReadPointer};
pub use id::{CacheKey, CompositeId, IdentifierError, compare, encode};
pub use message::{ChatMessage, MessageSummary, MessageType, UnknownMessageType};
