//! Chat service.
//!
//! Wires the pipeline to its consumers and exposes the entry points used by
//! request handlers:
//!
//! ```text
//! send/publish -> IngestPipeline -+-> PersistWorker -> Storage, LatestIndex, RecencyCache
//!                                 +-> fan-out       -> ConversationHub
//! record_read  -> ReadStateCoordinator -> ConversationHub, Storage
//! get_history  -> HistoryReader (RecencyCache, Storage)
//! unread_counts -> RecencyCache
//! ```
//!
//! Background tasks share one cancellation token. [`ChatService::shutdown`]
//! closes the pipeline, cancels the read-state task and waits for all of them,
//! so the last batch and the last flush complete before it returns.

use std::{collections::HashMap, sync::Arc};

use studychat_proto::{
    ChatMessage, CompositeId, ConversationEvent, IdentifierError, MessageSummary, MessageType,
};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    cache::{RecencyCache, UnreadCount},
    config::ChatConfig,
    env::Environment,
    error::ServerError,
    history::{HistoryError, HistoryReader},
    hub::{ConversationHub, run_fan_out},
    latest::LatestIndex,
    persist::PersistWorker,
    pipeline::{IngestPipeline, PipelineStats},
    read_state::{FlushOutcome, ReadStateCoordinator, ReadStateError},
    sequencer::{IdSequencer, SequencerError},
    storage::Storage,
    system_env::SystemEnv,
};

/// Running chat pipeline.
pub struct ChatService<S: Storage, E: Environment = SystemEnv> {
    pipeline: IngestPipeline,
    sequencer: IdSequencer<E>,
    history: HistoryReader<S>,
    read_state: Arc<ReadStateCoordinator<S>>,
    cache: Arc<dyn RecencyCache>,
    hub: Arc<ConversationHub>,
    latest: LatestIndex,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl<S: Storage, E: Environment> ChatService<S, E> {
    /// Warm the latest-message index and spawn the background tasks.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// - `ServerError::Config` if the shard id does not fit the id layout
    /// - `ServerError::Storage` if the durable log cannot be read
    pub async fn start(
        storage: S,
        cache: Arc<dyn RecencyCache>,
        hub: Arc<ConversationHub>,
        config: ChatConfig,
        env: E,
    ) -> Result<Self, ServerError> {
        let sequencer = IdSequencer::new(env, config.shard_id).map_err(|e| match e {
            SequencerError::InvalidShard(_) => ServerError::Config(e.to_string()),
            other => ServerError::Sequencer(other),
        })?;

        let latest = LatestIndex::new();
        latest.warm(&storage).await?;

        let pipeline = IngestPipeline::new(config.ingest_capacity);
        let worker =
            PersistWorker::new(storage.clone(), cache.clone(), latest.clone(), config.batch);
        let read_state =
            Arc::new(ReadStateCoordinator::new(storage.clone(), hub.clone(), config.read_state));
        let shutdown = CancellationToken::new();

        let tasks = vec![
            tokio::spawn(worker.run(pipeline.subscribe())),
            tokio::spawn(run_fan_out(pipeline.subscribe(), hub.clone())),
            tokio::spawn(read_state.clone().run(shutdown.clone())),
        ];

        tracing::info!(
            shard = sequencer.shard(),
            consumers = pipeline.subscriber_count(),
            cache_capacity = cache.capacity(),
            "Chat service started"
        );

        Ok(Self {
            pipeline,
            sequencer,
            history: HistoryReader::new(storage, cache.clone()),
            read_state,
            cache,
            hub,
            latest,
            shutdown,
            tasks,
        })
    }

    /// Issue an id for a new message and publish it.
    ///
    /// Returns the message as published.
    pub fn send(
        &self,
        conversation_id: &str,
        sender_id: &str,
        kind: MessageType,
        content: &str,
    ) -> Result<ChatMessage, ServerError> {
        let id = self.sequencer.next_id()?;
        let message = ChatMessage::new(id, kind, conversation_id, sender_id, content);
        self.publish(message.clone());
        Ok(message)
    }

    /// Publish an already-identified message. Never waits.
    ///
    /// Returns the number of consumers that accepted it.
    pub fn publish(&self, message: ChatMessage) -> usize {
        self.pipeline.publish(message)
    }

    /// Messages of a conversation with id `>= from_id`, newest first.
    pub async fn get_history(
        &self,
        conversation_id: &str,
        from_id: &str,
    ) -> Result<Vec<ChatMessage>, HistoryError> {
        self.history.get_history(conversation_id, from_id).await
    }

    /// Record a read pointer for the next flush.
    pub fn record_read(
        &self,
        conversation_id: &str,
        user_id: &str,
        message_id: &str,
    ) -> Result<(), ReadStateError> {
        self.read_state.record(conversation_id, user_id, message_id)
    }

    /// Unread counts for a set of read pointers (conversation -> hex id).
    pub async fn unread_counts(
        &self,
        pointers: &HashMap<String, String>,
    ) -> Result<HashMap<String, UnreadCount>, ServerError> {
        let parsed = pointers
            .iter()
            .map(|(conversation_id, id)| Ok((conversation_id.clone(), CompositeId::from_hex(id)?)))
            .collect::<Result<HashMap<_, _>, IdentifierError>>()
            .map_err(|e| ServerError::Cache(e.into()))?;

        Ok(self.cache.unread_counts(&parsed).await?)
    }

    /// Summary of the newest persisted message of a conversation.
    pub fn latest(&self, conversation_id: &str) -> Option<MessageSummary> {
        self.latest.get(conversation_id)
    }

    /// Flush pending read pointers now.
    pub async fn flush_read_state(&self) -> Result<FlushOutcome, ReadStateError> {
        self.read_state.flush().await
    }

    /// Live events of a conversation.
    pub fn subscribe(&self, conversation_id: &str) -> broadcast::Receiver<ConversationEvent> {
        self.hub.subscribe(conversation_id)
    }

    /// Pipeline counters.
    pub fn pipeline_stats(&self) -> PipelineStats {
        self.pipeline.stats()
    }

    /// Stop accepting messages and wait for the background tasks.
    pub async fn shutdown(self) -> Result<(), ServerError> {
        tracing::info!("Chat service shutting down");
        self.pipeline.close();
        self.shutdown.cancel();

        for task in self.tasks {
            task.await.map_err(|e| ServerError::Internal(format!("background task failed: {e}")))?;
        }

        let stats = self.pipeline.stats();
        tracing::info!(published = stats.published, dropped = stats.dropped, "Chat service stopped");
        Ok(())
    }
}
