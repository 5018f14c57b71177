//! Live conversation subscriptions.
//!
//! The hub maps each conversation with live subscribers to a broadcast
//! channel. Senders are created on first subscribe and pruned once the last
//! receiver is gone, so conversations nobody watches cost nothing. Offline
//! clients get no delivery guarantee; they catch up through history reads.

use std::sync::Arc;

use dashmap::DashMap;
use studychat_proto::ConversationEvent;
use tokio::sync::broadcast;

use crate::pipeline::Subscription;

/// Default per-conversation broadcast buffer.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Delivery target for conversation events.
pub trait ConversationSink: Send + Sync + 'static {
    /// Deliver an event to the live subscribers of a conversation.
    ///
    /// Returns the number of receivers reached.
    fn send_to_conversation(&self, conversation_id: &str, event: ConversationEvent) -> usize;
}

/// Conversation id -> broadcast channel of live subscribers.
#[derive(Debug)]
pub struct ConversationHub {
    channels: DashMap<String, broadcast::Sender<ConversationEvent>>,
    channel_capacity: usize,
}

impl Default for ConversationHub {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl ConversationHub {
    /// Hub whose per-conversation channels buffer `channel_capacity` events.
    pub fn new(channel_capacity: usize) -> Self {
        Self { channels: DashMap::new(), channel_capacity: channel_capacity.max(1) }
    }

    /// Subscribe to a conversation's live events.
    pub fn subscribe(&self, conversation_id: &str) -> broadcast::Receiver<ConversationEvent> {
        self.channels
            .entry(conversation_id.to_string())
            .or_insert_with(|| broadcast::channel(self.channel_capacity).0)
            .subscribe()
    }

    /// Conversations with a channel.
    pub fn conversation_count(&self) -> usize {
        self.channels.len()
    }
}

impl ConversationSink for ConversationHub {
    fn send_to_conversation(&self, conversation_id: &str, event: ConversationEvent) -> usize {
        let sent = self.channels.get(conversation_id).map(|tx| tx.send(event));

        match sent {
            Some(Ok(receivers)) => receivers,
            Some(Err(_)) => {
                // Every receiver dropped since the last send
                self.channels.remove_if(conversation_id, |_, tx| tx.receiver_count() == 0);
                tracing::debug!(conversation_id, "Pruned conversation channel");
                0
            },
            None => 0,
        }
    }
}

/// Forward every pipeline message to its conversation's live subscribers.
pub async fn run_fan_out(mut subscription: Subscription, sink: Arc<dyn ConversationSink>) {
    while let Some(message) = subscription.recv().await {
        let conversation_id = message.conversation_id.clone();
        let receivers = sink.send_to_conversation(&conversation_id, ConversationEvent::Message(message));
        tracing::trace!(conversation_id = %conversation_id, receivers, "Fanned out message");
    }
    tracing::info!("Fan-out stopped");
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use studychat_proto::{ChatMessage, CompositeId, MessageType};

    use super::*;
    use crate::pipeline::IngestPipeline;

    fn create_test_message(conversation_id: &str, timestamp: u64) -> ChatMessage {
        let id = CompositeId::new(timestamp, 0, 0).expect("valid id");
        ChatMessage::new(id, MessageType::Text, conversation_id, "alice", "hi")
    }

    #[tokio::test]
    async fn test_send_reaches_subscribers_of_that_conversation() {
        let hub = ConversationHub::default();
        let mut a = hub.subscribe("a");
        let _b = hub.subscribe("b");

        let event = ConversationEvent::ReadReceipts {
            conversation_id: "a".to_string(),
            pointers: BTreeMap::new(),
        };
        assert_eq!(hub.send_to_conversation("a", event.clone()), 1);
        assert_eq!(a.recv().await.unwrap(), event);
        assert_eq!(hub.send_to_conversation("nobody", event), 0);
    }

    #[test]
    fn test_channel_pruned_after_last_receiver() {
        let hub = ConversationHub::default();
        drop(hub.subscribe("a"));
        assert_eq!(hub.conversation_count(), 1);

        let event = ConversationEvent::Message(create_test_message("a", 1));
        assert_eq!(hub.send_to_conversation("a", event), 0);
        assert_eq!(hub.conversation_count(), 0);
    }

    #[tokio::test]
    async fn test_fan_out_forwards_pipeline_messages() {
        let hub = Arc::new(ConversationHub::default());
        let mut receiver = hub.subscribe("a");

        let pipeline = IngestPipeline::new(8);
        let handle = tokio::spawn(run_fan_out(pipeline.subscribe(), hub.clone()));

        let message = create_test_message("a", 1);
        pipeline.publish(message.clone());
        pipeline.close();
        handle.await.unwrap();

        assert_eq!(receiver.recv().await.unwrap(), ConversationEvent::Message(message));
    }
}
