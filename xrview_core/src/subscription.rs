//! Owned topic subscriptions.

use std::sync::Arc;

use tracing::debug;
use xrview_env::{EnvError, MessageHandler, MessageKind, SubscribeOptions, SubscriptionId, TopicTransport};

/// A live subscription that is torn down when dropped.
pub struct TopicSubscription {
    transport: Arc<dyn TopicTransport>,
    topic: String,
    kind: MessageKind,
    id: Option<SubscriptionId>,
}

impl TopicSubscription {
    /// Subscribes `handler` to `topic`.
    pub fn subscribe(
        transport: Arc<dyn TopicTransport>,
        topic: &str,
        kind: MessageKind,
        options: SubscribeOptions,
        handler: MessageHandler,
    ) -> Result<Self, EnvError> {
        let id = transport.subscribe(topic, kind, options, handler)?;
        debug!(topic = %topic, kind = %kind, id = %id, "Subscribed");
        Ok(Self {
            transport,
            topic: topic.to_string(),
            kind,
            id: Some(id),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn is_active(&self) -> bool {
        self.id.is_some()
    }

    /// Tears the subscription down. Idempotent.
    pub fn unsubscribe(&mut self) {
        if let Some(id) = self.id.take() {
            self.transport.unsubscribe(id);
            debug!(topic = %self.topic, id = %id, "Unsubscribed");
        }
    }
}

impl Drop for TopicSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for TopicSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicSubscription")
            .field("topic", &self.topic)
            .field("kind", &self.kind)
            .field("id", &self.id)
            .finish()
    }
}
