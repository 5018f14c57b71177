//! Redis-streams recency cache.
//!
//! One stream per conversation (`{prefix}:{conversation_id}`). Stream entry
//! ids are the cache keys themselves (`millis-seq`), so Redis orders and
//! range-scans entries exactly like the durable log. Trimming uses
//! `XADD ... MAXLEN ~ N`.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::{
    Script,
    aio::{ConnectionLike, ConnectionManager},
    streams::{StreamId, StreamRangeReply},
};
use studychat_proto::{CacheKey, ChatMessage, CompositeId, MessageType};

use super::{CacheEntry, CacheError, ProbeWindow, RecencyCache};

const DEFAULT_PREFIX: &str = "studychat:conv";

const FIELD_ID: &str = "id";
const FIELD_TYPE: &str = "type";
const FIELD_SENDER: &str = "sender";
const FIELD_CONTENT: &str = "content";

/// Appends every message with its own `XADD` and reports per-item status, so
/// a rejected item does not hide the outcome of the others.
///
/// KEYS: one stream per message. ARGV[1]: cap, then five values per message
/// (stream id, message id, type, sender, content).
const APPEND_SCRIPT: &str = r"
local results = {}
for i, key in ipairs(KEYS) do
  local base = (i - 1) * 5 + 1
  local reply = redis.pcall('XADD', key, 'MAXLEN', '~', ARGV[1], ARGV[base + 1],
    'id', ARGV[base + 2], 'type', ARGV[base + 3],
    'sender', ARGV[base + 4], 'content', ARGV[base + 5])
  if type(reply) == 'table' and reply.err then
    results[i] = reply.err
  else
    results[i] = 'OK'
  end
end
return results
";

/// Recency cache stored in Redis streams.
///
/// Generic over the connection so tests can run it against a scripted one;
/// production uses the reconnecting [`ConnectionManager`].
pub struct RedisCache<C = ConnectionManager> {
    connection: C,
    prefix: String,
    capacity: usize,
    append_script: Script,
}

impl RedisCache {
    /// Connect with the default key prefix.
    pub async fn connect(redis_url: &str, capacity: usize) -> Result<Self, CacheError> {
        Self::connect_with_prefix(redis_url, DEFAULT_PREFIX, capacity).await
    }

    /// Connect with a custom key prefix.
    pub async fn connect_with_prefix(
        redis_url: &str,
        prefix: impl Into<String>,
        capacity: usize,
    ) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url).map_err(|e| CacheError::Backend(e.to_string()))?;
        let manager =
            ConnectionManager::new(client).await.map_err(|e| CacheError::Backend(e.to_string()))?;

        Ok(RedisCache::with_connection(manager, prefix, capacity))
    }
}

impl<C> RedisCache<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    /// Cache over an established connection.
    pub fn with_connection(connection: C, prefix: impl Into<String>, capacity: usize) -> Self {
        Self {
            connection,
            prefix: prefix.into(),
            capacity,
            append_script: Script::new(APPEND_SCRIPT),
        }
    }

    fn stream_key(&self, conversation_id: &str) -> String {
        format!("{}:{conversation_id}", self.prefix)
    }
}

#[async_trait]
impl<C> RecencyCache for RedisCache<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    fn capacity(&self) -> usize {
        self.capacity
    }

    async fn append_batch(&self, messages: &[ChatMessage]) -> Result<(), CacheError> {
        if messages.is_empty() {
            return Ok(());
        }

        let mut invocation = self.append_script.prepare_invoke();
        invocation.arg(self.capacity);
        for message in messages {
            invocation
                .key(self.stream_key(&message.conversation_id))
                .arg(message.cache_key().to_string())
                .arg(message.id.to_string())
                .arg(message.kind.as_str())
                .arg(&message.sender_id)
                .arg(&message.content);
        }

        let mut conn = self.connection.clone();
        let statuses: Vec<String> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;

        let failures: Vec<_> = messages
            .iter()
            .zip(statuses)
            .filter(|(_, status)| status != "OK")
            .map(|(message, status)| (message.id, CacheError::Backend(status)))
            .collect();

        if failures.is_empty() { Ok(()) } else { Err(CacheError::Partial { failures }) }
    }

    async fn latest(&self, conversation_id: &str) -> Result<Option<ChatMessage>, CacheError> {
        let mut conn = self.connection.clone();
        let reply: StreamRangeReply = redis::cmd("XREVRANGE")
            .arg(self.stream_key(conversation_id))
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;

        reply.ids.first().map(|entry| decode_entry(conversation_id, entry)).transpose()
    }

    async fn since(
        &self,
        conversation_id: &str,
        from: CacheKey,
    ) -> Result<Vec<ChatMessage>, CacheError> {
        let mut conn = self.connection.clone();
        let reply: StreamRangeReply = redis::cmd("XREVRANGE")
            .arg(self.stream_key(conversation_id))
            .arg("+")
            .arg(from.to_string())
            .arg("COUNT")
            .arg(self.capacity)
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;

        reply.ids.iter().map(|entry| decode_entry(conversation_id, entry)).collect()
    }

    async fn probe_many(
        &self,
        pointers: &[(String, CacheKey)],
        limit: usize,
    ) -> Result<HashMap<String, ProbeWindow>, CacheError> {
        if pointers.is_empty() {
            return Ok(HashMap::new());
        }

        // Three reads per conversation: oldest, newest, entries after pointer
        let mut pipe = redis::pipe();
        for (conversation_id, pointer) in pointers {
            let key = self.stream_key(conversation_id);
            pipe.cmd("XRANGE").arg(&key).arg("-").arg("+").arg("COUNT").arg(1);
            pipe.cmd("XREVRANGE").arg(&key).arg("+").arg("-").arg("COUNT").arg(1);
            pipe.cmd("XRANGE").arg(&key).arg(format!("({pointer}")).arg("+").arg("COUNT").arg(limit);
        }

        let mut conn = self.connection.clone();
        let replies: Vec<StreamRangeReply> =
            pipe.query_async(&mut conn).await.map_err(|e| CacheError::Backend(e.to_string()))?;

        if replies.len() != pointers.len() * 3 {
            return Err(CacheError::Backend(format!(
                "probe pipeline returned {} replies for {} commands",
                replies.len(),
                pointers.len() * 3
            )));
        }

        let mut windows = HashMap::with_capacity(pointers.len());
        for ((conversation_id, _), chunk) in pointers.iter().zip(replies.chunks(3)) {
            let [oldest, newest, after] = chunk else {
                continue;
            };
            let Some(newest) = newest.ids.first() else {
                continue;
            };

            let oldest = oldest
                .ids
                .first()
                .map(|entry| parse_stream_id(&entry.id))
                .transpose()?;

            windows.insert(
                conversation_id.clone(),
                ProbeWindow {
                    oldest,
                    newest: Some(decode_entry(conversation_id, newest)?),
                    after: after.ids.len(),
                },
            );
        }

        Ok(windows)
    }
}

fn parse_stream_id(raw: &str) -> Result<CacheKey, CacheError> {
    raw.parse().map_err(|e| CacheError::Corrupt(format!("stream id {raw:?}: {e}")))
}

/// Rebuild a message from a stream entry.
fn decode_entry(conversation_id: &str, entry: &StreamId) -> Result<ChatMessage, CacheError> {
    let field = |name: &str| {
        entry
            .get::<String>(name)
            .ok_or_else(|| CacheError::Corrupt(format!("entry {} has no {name} field", entry.id)))
    };

    let key = parse_stream_id(&entry.id)?;
    let id = CompositeId::from_hex(&field(FIELD_ID)?)
        .map_err(|e| CacheError::Corrupt(format!("entry {}: {e}", entry.id)))?;
    if id.cache_key() != key {
        return Err(CacheError::Corrupt(format!(
            "entry {} stores id {id} with key {}",
            entry.id,
            id.cache_key()
        )));
    }

    let kind: MessageType = field(FIELD_TYPE)?
        .parse()
        .map_err(|e| CacheError::Corrupt(format!("entry {}: {e}", entry.id)))?;

    let cached = CacheEntry {
        id,
        kind,
        sender_id: field(FIELD_SENDER)?,
        content: field(FIELD_CONTENT)?,
    };
    Ok(cached.into_message(conversation_id))
}
