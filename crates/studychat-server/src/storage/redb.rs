//! Redb-backed durable storage implementation.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety.
//! All state survives server restarts.

use std::{collections::HashMap, path::Path, sync::Arc};

use redb::{Database, ReadOnlyTable, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use studychat_proto::{CacheKey, ChatMessage, CompositeId, MessageType, ReadPointer};

use super::{Direction, Storage, StorageError};

/// Table: messages
/// Key: [conversation prefix][millis: 8 bytes BE][sequence: 2 bytes BE]
/// Value: CBOR-encoded StoredMessage
const MESSAGES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("messages");

/// Table: conversations
/// Key: conversation id bytes
/// Value: empty
const CONVERSATIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("conversations");

/// Table: read_pointers
/// Key: [conversation prefix][user id bytes]
/// Value: raw message id (8 bytes BE)
const READ_POINTERS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("read_pointers");

/// On-disk record of a chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StoredMessage {
    id: u64,
    kind: MessageType,
    conversation_id: String,
    sender_id: String,
    content: String,
}

impl From<&ChatMessage> for StoredMessage {
    fn from(message: &ChatMessage) -> Self {
        Self {
            id: message.id.raw(),
            kind: message.kind,
            conversation_id: message.conversation_id.clone(),
            sender_id: message.sender_id.clone(),
            content: message.content.clone(),
        }
    }
}

impl TryFrom<StoredMessage> for ChatMessage {
    type Error = StorageError;

    fn try_from(stored: StoredMessage) -> Result<Self, Self::Error> {
        let id = CompositeId::from_raw(stored.id)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        Ok(ChatMessage::new(
            id,
            stored.kind,
            stored.conversation_id,
            stored.sender_id,
            stored.content,
        ))
    }
}

/// Durable storage backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open or create a Redb database at the given path.
    ///
    /// Creates tables if they don't exist (MESSAGES, CONVERSATIONS,
    /// READ_POINTERS).
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(|e| StorageError::Io(e.to_string()))?;

        let txn = db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;
        {
            let _ = txn.open_table(MESSAGES).map_err(|e| StorageError::Io(e.to_string()))?;
            let _ = txn.open_table(CONVERSATIONS).map_err(|e| StorageError::Io(e.to_string()))?;
            let _ = txn.open_table(READ_POINTERS).map_err(|e| StorageError::Io(e.to_string()))?;
        }
        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Scan `[start, end)` of one conversation's log.
    fn scan(
        &self,
        conversation_id: &str,
        start: CacheKey,
        end: CacheKey,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StorageError> {
        if start >= end || limit == 0 {
            return Ok(Vec::new());
        }

        let start_key = encode_message_key(conversation_id, start)?;
        let end_key = encode_message_key(conversation_id, end)?;

        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(MESSAGES).map_err(|e| StorageError::Io(e.to_string()))?;

        let range = table
            .range(start_key.as_slice()..end_key.as_slice())
            .map_err(|e| StorageError::Io(e.to_string()))?;

        let mut messages = Vec::with_capacity(limit.min(256));
        match direction {
            Direction::OldestFirst => {
                for result in range.take(limit) {
                    let (_, value) = result.map_err(|e| StorageError::Io(e.to_string()))?;
                    messages.push(decode_message(value.value())?);
                }
            },
            Direction::NewestFirst => {
                for result in range.rev().take(limit) {
                    let (_, value) = result.map_err(|e| StorageError::Io(e.to_string()))?;
                    messages.push(decode_message(value.value())?);
                }
            },
        }

        Ok(messages)
    }
}

impl Storage for RedbStorage {
    fn insert_many(&self, messages: &[ChatMessage]) -> Result<Vec<ChatMessage>, StorageError> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }

        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        let mut inserted = Vec::with_capacity(messages.len());
        {
            let mut table =
                txn.open_table(MESSAGES).map_err(|e| StorageError::Io(e.to_string()))?;
            let mut conversations =
                txn.open_table(CONVERSATIONS).map_err(|e| StorageError::Io(e.to_string()))?;

            for message in messages {
                let key = encode_message_key(&message.conversation_id, message.cache_key())?;

                let exists = table
                    .get(key.as_slice())
                    .map_err(|e| StorageError::Io(e.to_string()))?
                    .is_some();
                if exists {
                    continue;
                }

                let mut bytes = Vec::with_capacity(64 + message.content.len());
                ciborium::into_writer(&StoredMessage::from(message), &mut bytes)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;

                table
                    .insert(key.as_slice(), bytes.as_slice())
                    .map_err(|e| StorageError::Io(e.to_string()))?;
                conversations
                    .insert(message.conversation_id.as_bytes(), b"".as_slice())
                    .map_err(|e| StorageError::Io(e.to_string()))?;

                inserted.push(message.clone());
            }
        }

        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(inserted)
    }

    fn range_query(
        &self,
        conversation_id: &str,
        from: CompositeId,
        to: CompositeId,
    ) -> Result<Vec<ChatMessage>, StorageError> {
        self.scan(
            conversation_id,
            from.cache_key(),
            to.cache_key(),
            Direction::OldestFirst,
            usize::MAX,
        )
    }

    fn range_from(
        &self,
        conversation_id: &str,
        from: CompositeId,
        direction: Direction,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StorageError> {
        self.scan(conversation_id, from.cache_key(), CacheKey::MAX, direction, limit)
    }

    fn latest_message(&self, conversation_id: &str) -> Result<Option<ChatMessage>, StorageError> {
        let newest =
            self.scan(conversation_id, CacheKey::MIN, CacheKey::MAX, Direction::NewestFirst, 1)?;
        Ok(newest.into_iter().next())
    }

    fn list_conversations(&self) -> Result<Vec<String>, StorageError> {
        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(CONVERSATIONS).map_err(|e| StorageError::Io(e.to_string()))?;

        let mut conversations = Vec::new();
        for result in table.iter().map_err(|e| StorageError::Io(e.to_string()))? {
            let (key, _) = result.map_err(|e| StorageError::Io(e.to_string()))?;
            let id = std::str::from_utf8(key.value())
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            conversations.push(id.to_string());
        }

        Ok(conversations)
    }

    fn store_read_pointers(&self, pointers: &[ReadPointer]) -> Result<(), StorageError> {
        if pointers.is_empty() {
            return Ok(());
        }

        let txn = self.db.begin_write().map_err(|e| StorageError::Io(e.to_string()))?;

        {
            let mut table =
                txn.open_table(READ_POINTERS).map_err(|e| StorageError::Io(e.to_string()))?;

            for pointer in pointers {
                let mut key = encode_conversation_prefix(&pointer.conversation_id)?;
                key.extend_from_slice(pointer.user_id.as_bytes());

                table
                    .insert(key.as_slice(), pointer.message_id.raw().to_be_bytes().as_slice())
                    .map_err(|e| StorageError::Io(e.to_string()))?;
            }
        }

        txn.commit().map_err(|e| StorageError::Io(e.to_string()))?;

        Ok(())
    }

    fn load_read_pointers(
        &self,
        conversation_id: &str,
    ) -> Result<HashMap<String, CompositeId>, StorageError> {
        let prefix = encode_conversation_prefix(conversation_id)?;

        let txn = self.db.begin_read().map_err(|e| StorageError::Io(e.to_string()))?;
        let table = txn.open_table(READ_POINTERS).map_err(|e| StorageError::Io(e.to_string()))?;

        read_pointers_with_prefix(&table, &prefix)
    }
}

fn read_pointers_with_prefix(
    table: &ReadOnlyTable<&'static [u8], &'static [u8]>,
    prefix: &[u8],
) -> Result<HashMap<String, CompositeId>, StorageError> {
    let results = table.range(prefix..).map_err(|e| StorageError::Io(e.to_string()))?;

    let mut pointers = HashMap::new();
    for result in results {
        let (key, value) = result.map_err(|e| StorageError::Io(e.to_string()))?;
        let Some(user) = key.value().strip_prefix(prefix) else {
            break;
        };

        let user = std::str::from_utf8(user)
            .map_err(|e| StorageError::Serialization(e.to_string()))?
            .to_string();
        let raw: [u8; 8] = value
            .value()
            .try_into()
            .map_err(|_| StorageError::Serialization("read pointer is not 8 bytes".to_string()))?;
        let id = CompositeId::from_raw(u64::from_be_bytes(raw))
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        pointers.insert(user, id);
    }

    Ok(pointers)
}

/// Length-prefixed conversation id.
///
/// Layout: [len: 2 bytes BE][conversation id bytes]
/// The length prefix keeps one conversation's keys from interleaving with
/// another whose id it is a prefix of.
fn encode_conversation_prefix(conversation_id: &str) -> Result<Vec<u8>, StorageError> {
    let len = u16::try_from(conversation_id.len()).map_err(|_| {
        StorageError::Serialization(format!(
            "conversation id too long: {} bytes",
            conversation_id.len()
        ))
    })?;

    let mut key = Vec::with_capacity(2 + conversation_id.len() + 10);
    key.extend_from_slice(&len.to_be_bytes());
    key.extend_from_slice(conversation_id.as_bytes());
    Ok(key)
}

/// Encode (conversation, cache key) so lexicographic order matches key order.
fn encode_message_key(conversation_id: &str, key: CacheKey) -> Result<Vec<u8>, StorageError> {
    let mut bytes = encode_conversation_prefix(conversation_id)?;
    bytes.extend_from_slice(&key.millis().to_be_bytes());
    bytes.extend_from_slice(&key.sequence().to_be_bytes());
    Ok(bytes)
}

fn decode_message(bytes: &[u8]) -> Result<ChatMessage, StorageError> {
    let stored: StoredMessage =
        ciborium::from_reader(bytes).map_err(|e| StorageError::Serialization(e.to_string()))?;
    ChatMessage::try_from(stored)
}
