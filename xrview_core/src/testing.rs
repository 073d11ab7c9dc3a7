//! In-process bus for unit tests: synchronous delivery, no queueing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use nalgebra::Isometry3;
use xrview_env::msgs::{Header, Message, MessageKind, TransformStamped};
use xrview_env::{
    EnvError, MessageHandler, SubscribeOptions, SubscriptionId, TopicTransport, TransformHandler,
    TransformSource,
};

use crate::pose::transform_to_msg;
use crate::scene::lock;

type SharedHandler = Arc<Mutex<MessageHandler>>;
type SharedTfHandler = Arc<Mutex<TransformHandler>>;

#[derive(Default)]
pub struct LoopbackBus {
    topics: Mutex<HashMap<SubscriptionId, (String, MessageKind, SharedHandler)>>,
    frames: Mutex<HashMap<SubscriptionId, (String, SharedTfHandler)>>,
    latest: Mutex<HashMap<String, TransformStamped>>,
    published: Mutex<Vec<(String, Message)>>,
}

impl LoopbackBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Delivers `message` to every matching subscriber.
    pub fn deliver(&self, topic: &str, message: Message) -> usize {
        let handlers: Vec<SharedHandler> = lock(&self.topics)
            .values()
            .filter(|(t, kind, _)| t == topic && *kind == message.kind())
            .map(|(_, _, h)| h.clone())
            .collect();
        for handler in &handlers {
            let mut handler = lock(handler);
            (*handler)(&message);
        }
        handlers.len()
    }

    pub fn set_transform(&self, frame_id: &str, pose: Isometry3<f64>) {
        let msg = TransformStamped {
            header: Header::new("map"),
            child_frame_id: frame_id.to_string(),
            transform: transform_to_msg(&pose),
        };
        lock(&self.latest).insert(frame_id.to_string(), msg.clone());

        let handlers: Vec<SharedTfHandler> = lock(&self.frames)
            .values()
            .filter(|(f, _)| f == frame_id)
            .map(|(_, h)| h.clone())
            .collect();
        for handler in handlers {
            let mut handler = lock(&handler);
            (*handler)(&msg);
        }
    }

    pub fn topic_subscribers(&self, topic: &str) -> usize {
        lock(&self.topics).values().filter(|(t, _, _)| t == topic).count()
    }

    pub fn frame_subscribers(&self) -> usize {
        lock(&self.frames).len()
    }

    pub fn published(&self) -> Vec<(String, Message)> {
        lock(&self.published).clone()
    }
}

impl TopicTransport for LoopbackBus {
    fn subscribe(
        &self,
        topic: &str,
        kind: MessageKind,
        _options: SubscribeOptions,
        handler: MessageHandler,
    ) -> Result<SubscriptionId, EnvError> {
        let id = SubscriptionId::new();
        lock(&self.topics).insert(id, (topic.to_string(), kind, Arc::new(Mutex::new(handler))));
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        lock(&self.topics).remove(&id);
    }

    fn publish(&self, topic: &str, message: Message) -> Result<(), EnvError> {
        lock(&self.published).push((topic.to_string(), message));
        Ok(())
    }
}

impl TransformSource for LoopbackBus {
    fn subscribe_frame(&self, frame_id: &str, mut handler: TransformHandler) -> SubscriptionId {
        if let Some(latest) = lock(&self.latest).get(frame_id) {
            handler(latest);
        }
        let id = SubscriptionId::new();
        lock(&self.frames).insert(id, (frame_id.to_string(), Arc::new(Mutex::new(handler))));
        id
    }

    fn unsubscribe_frame(&self, id: SubscriptionId) {
        lock(&self.frames).remove(&id);
    }
}
