//! Simulated robot bridge: an in-memory topic bus with fault injection.
//!
//! ```text
//!   oracle ──inject()──► [per-subscription queue] ──flush()──► handler(&msg)
//!                          │ queue_size = 1: newest wins (0: unbounded)
//!                          │ throttle_rate_ms: at most one delivery per window
//!                          └ drop_rate: seeded random loss
//! ```
//!
//! Messages never reach a handler from inside `inject()`. The runner calls
//! `flush()` once per tick, which is the only delivery point, so handler
//! execution never interleaves with a render tick.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nalgebra::Isometry3;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use xrview_core::pose::transform_to_msg;
use xrview_core::pose_publisher::stamp_from;
use xrview_env::msgs::{Header, Message, MessageKind, TransformStamped};
use xrview_env::{
    EnvError, MessageHandler, SceneContext, SubscribeOptions, SubscriptionId, TopicTransport,
    TransformHandler, TransformSource,
};

use crate::context::SimContext;

type SharedHandler = Arc<Mutex<MessageHandler>>;
type SharedTfHandler = Arc<Mutex<TransformHandler>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Delivery counters for the whole bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    /// Messages handed to `inject()`, counted once per matching subscription
    pub enqueued: u64,

    /// Messages that reached a handler
    pub delivered: u64,

    /// Queued messages replaced by a newer one before delivery
    pub overwritten: u64,

    /// Messages lost to the injected drop rate
    pub dropped: u64,

    /// Transform updates delivered to frame handlers
    pub transforms_delivered: u64,
}

struct TopicSub {
    topic: String,
    kind: MessageKind,
    options: SubscribeOptions,
    handler: SharedHandler,
    pending: VecDeque<Message>,
    last_delivery_ns: Option<u64>,
}

impl TopicSub {
    fn throttle_open(&self, now_ns: u64) -> bool {
        match self.last_delivery_ns {
            None => true,
            Some(last) => now_ns.saturating_sub(last) >= self.options.throttle_rate_ms as u64 * 1_000_000,
        }
    }
}

struct FrameSub {
    frame_id: String,
    handler: SharedTfHandler,
}

#[derive(Default)]
struct BusState {
    next_seq: u64,
    topics: BTreeMap<u64, TopicSub>,
    topic_ids: HashMap<SubscriptionId, u64>,
    frames: BTreeMap<u64, FrameSub>,
    frame_ids: HashMap<SubscriptionId, u64>,
    latest_tf: HashMap<String, TransformStamped>,
    outbox: Vec<(String, Message)>,
    stats: BusStats,
}

impl BusState {
    fn next_id(&mut self) -> (u64, SubscriptionId) {
        self.next_seq += 1;
        (self.next_seq, SubscriptionId::from_seed(self.next_seq))
    }
}

/// In-memory bridge used by every simulation scenario.
pub struct SimBus {
    context: SimContext,
    fixed_frame: String,
    drop_rate: Mutex<f64>,
    state: Mutex<BusState>,
}

impl SimBus {
    /// Creates a bus on the given context's clock and RNG.
    pub fn new(context: SimContext, fixed_frame: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            context,
            fixed_frame: fixed_frame.into(),
            drop_rate: Mutex::new(0.0),
            state: Mutex::new(BusState::default()),
        })
    }

    /// Sets the probability that an injected message is lost.
    pub fn set_drop_rate(&self, rate: f64) {
        *lock(&self.drop_rate) = rate.clamp(0.0, 1.0);
    }

    /// Offers a message from the robot side.
    ///
    /// The message is queued on every subscription of `topic` whose type
    /// matches. When a bounded queue exceeds its depth the oldest entry is
    /// discarded.
    ///
    /// # Returns
    /// Number of subscriptions that queued the message.
    pub fn inject(&self, topic: &str, message: Message) -> usize {
        let drop_rate = *lock(&self.drop_rate);
        let mut state = lock(&self.state);
        let seqs: Vec<u64> = state
            .topics
            .iter()
            .filter(|(_, sub)| sub.topic == topic && sub.kind == message.kind())
            .map(|(seq, _)| *seq)
            .collect();

        let mut queued = 0;
        for seq in seqs {
            if drop_rate > 0.0 && self.context.with_rng(|rng| rng.gen_bool(drop_rate)) {
                state.stats.dropped += 1;
                trace!(topic, "Dropped injected message");
                continue;
            }
            let mut overwritten = 0;
            if let Some(sub) = state.topics.get_mut(&seq) {
                sub.pending.push_back(message.clone());
                let depth = match sub.options.queue_size {
                    0 => usize::MAX,
                    n => n as usize,
                };
                while sub.pending.len() > depth {
                    sub.pending.pop_front();
                    overwritten += 1;
                }
                queued += 1;
            }
            state.stats.enqueued += 1;
            state.stats.overwritten += overwritten;
        }
        queued
    }

    /// Delivers queued messages whose throttle window is open.
    ///
    /// Unthrottled subscriptions drain their whole queue; throttled ones
    /// deliver at most one message per window. Handlers run after the bus
    /// lock is released, so they may subscribe or publish freely.
    ///
    /// # Returns
    /// Number of handler invocations.
    pub fn flush(&self) -> usize {
        let now_ns = self.context.time_ns();
        let mut batch: Vec<(SharedHandler, Message)> = Vec::new();
        {
            let mut state = lock(&self.state);
            for sub in state.topics.values_mut() {
                if sub.pending.is_empty() || !sub.throttle_open(now_ns) {
                    continue;
                }
                let take = if sub.options.throttle_rate_ms == 0 {
                    sub.pending.len()
                } else {
                    1
                };
                for message in sub.pending.drain(..take) {
                    batch.push((sub.handler.clone(), message));
                }
                sub.last_delivery_ns = Some(now_ns);
            }
            state.stats.delivered += batch.len() as u64;
        }

        for (handler, message) in &batch {
            let mut handler = lock(handler);
            (*handler)(message);
        }
        if !batch.is_empty() {
            trace!(delivered = batch.len(), "Flushed topic queues");
        }
        batch.len()
    }

    /// Publishes a transform for `frame_id` relative to the fixed frame and
    /// delivers it to every frame handler right away.
    pub fn set_transform(&self, frame_id: &str, pose: &Isometry3<f64>) {
        let mut header = Header::new(self.fixed_frame.clone());
        header.stamp = stamp_from(self.context.system_time());
        let msg = TransformStamped {
            header,
            child_frame_id: frame_id.to_string(),
            transform: transform_to_msg(pose),
        };

        let handlers: Vec<SharedTfHandler> = {
            let mut state = lock(&self.state);
            state.latest_tf.insert(frame_id.to_string(), msg.clone());
            let handlers: Vec<SharedTfHandler> = state
                .frames
                .values()
                .filter(|sub| sub.frame_id == frame_id)
                .map(|sub| sub.handler.clone())
                .collect();
            state.stats.transforms_delivered += handlers.len() as u64;
            handlers
        };
        for handler in handlers {
            let mut handler = lock(&handler);
            (*handler)(&msg);
        }
    }

    /// Messages published by the viewer, oldest first.
    pub fn outbox(&self) -> Vec<(String, Message)> {
        lock(&self.state).outbox.clone()
    }

    /// Number of published messages on `topic`.
    pub fn published_count(&self, topic: &str) -> usize {
        lock(&self.state).outbox.iter().filter(|(t, _)| t == topic).count()
    }

    pub fn stats(&self) -> BusStats {
        lock(&self.state).stats
    }

    /// Number of live subscriptions on `topic`.
    pub fn topic_subscribers(&self, topic: &str) -> usize {
        lock(&self.state).topics.values().filter(|s| s.topic == topic).count()
    }

    /// Number of live frame subscriptions across all frames.
    pub fn frame_subscribers(&self) -> usize {
        lock(&self.state).frames.len()
    }

    /// Messages waiting in any queue.
    pub fn pending(&self) -> usize {
        lock(&self.state).topics.values().map(|s| s.pending.len()).sum()
    }
}

impl TopicTransport for SimBus {
    fn subscribe(
        &self,
        topic: &str,
        kind: MessageKind,
        options: SubscribeOptions,
        handler: MessageHandler,
    ) -> Result<SubscriptionId, EnvError> {
        let mut state = lock(&self.state);
        let (seq, id) = state.next_id();
        debug!(topic, kind = kind.type_name(), queue = options.queue_size, "Topic subscribed");
        state.topics.insert(
            seq,
            TopicSub {
                topic: topic.to_string(),
                kind,
                options,
                handler: Arc::new(Mutex::new(handler)),
                pending: VecDeque::new(),
                last_delivery_ns: None,
            },
        );
        state.topic_ids.insert(id, seq);
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        let removed = {
            let mut state = lock(&self.state);
            let seq = state.topic_ids.remove(&id);
            seq.and_then(|seq| state.topics.remove(&seq))
        };
        // Dropped outside the lock: handlers may own frame trackers that
        // unsubscribe from this bus when they go
        if let Some(sub) = removed {
            debug!(topic = %sub.topic, "Topic unsubscribed");
        }
    }

    fn publish(&self, topic: &str, message: Message) -> Result<(), EnvError> {
        lock(&self.state).outbox.push((topic.to_string(), message));
        Ok(())
    }
}

impl TransformSource for SimBus {
    fn subscribe_frame(&self, frame_id: &str, mut handler: TransformHandler) -> SubscriptionId {
        let latest = lock(&self.state).latest_tf.get(frame_id).cloned();
        if let Some(latest) = latest {
            handler(&latest);
        }
        let mut state = lock(&self.state);
        let (seq, id) = state.next_id();
        state.frames.insert(
            seq,
            FrameSub {
                frame_id: frame_id.to_string(),
                handler: Arc::new(Mutex::new(handler)),
            },
        );
        state.frame_ids.insert(id, seq);
        id
    }

    fn unsubscribe_frame(&self, id: SubscriptionId) {
        let removed = {
            let mut state = lock(&self.state);
            let seq = state.frame_ids.remove(&id);
            seq.and_then(|seq| state.frames.remove(&seq))
        };
        drop(removed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use xrview_env::msgs::{Pose, PoseStamped};

    fn pose_msg(x: f64) -> Message {
        let mut msg = PoseStamped::default();
        msg.pose.position.x = x;
        Message::PoseStamped(msg)
    }

    fn recorder(bus: &SimBus, topic: &str, options: SubscribeOptions) -> Arc<Mutex<Vec<f64>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(
            topic,
            MessageKind::PoseStamped,
            options,
            Box::new(move |msg| {
                if let Message::PoseStamped(p) = msg {
                    sink.lock().unwrap().push(p.pose.position.x);
                }
            }),
        )
        .unwrap();
        seen
    }

    #[test]
    fn test_queue_depth_one_keeps_newest() {
        let bus = SimBus::new(SimContext::new(1), "map");
        let options = SubscribeOptions {
            queue_size: 1,
            ..SubscribeOptions::default()
        };
        let seen = recorder(&bus, "/pose", options);

        for i in 0..5 {
            bus.inject("/pose", pose_msg(i as f64));
        }
        assert_eq!(seen.lock().unwrap().len(), 0);
        assert_eq!(bus.flush(), 1);
        assert_eq!(*seen.lock().unwrap(), vec![4.0]);

        let stats = bus.stats();
        assert_eq!(stats.enqueued, 5);
        assert_eq!(stats.overwritten, 4);
        assert_eq!(stats.delivered, 1);
    }

    #[test]
    fn test_unbounded_queue_delivers_everything() {
        let bus = SimBus::new(SimContext::new(1), "map");
        let seen = recorder(&bus, "/pose", SubscribeOptions::default());
        for i in 0..5 {
            bus.inject("/pose", pose_msg(i as f64));
        }
        assert_eq!(bus.flush(), 5);
        assert_eq!(bus.stats().overwritten, 0);
        assert_eq!(seen.lock().unwrap().len(), 5);
    }

    #[test]
    fn test_deeper_queue_delivers_in_order() {
        let bus = SimBus::new(SimContext::new(1), "map");
        let options = SubscribeOptions {
            queue_size: 3,
            ..SubscribeOptions::default()
        };
        let seen = recorder(&bus, "/pose", options);
        for i in 0..4 {
            bus.inject("/pose", pose_msg(i as f64));
        }
        bus.flush();
        assert_eq!(*seen.lock().unwrap(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_throttle_spaces_deliveries() {
        let ctx = SimContext::new(1);
        let bus = SimBus::new(ctx.clone(), "map");
        let options = SubscribeOptions {
            throttle_rate_ms: 100,
            ..SubscribeOptions::default()
        };
        let seen = recorder(&bus, "/pose", options);

        bus.inject("/pose", pose_msg(1.0));
        assert_eq!(bus.flush(), 1);

        ctx.advance_time(Duration::from_millis(50));
        bus.inject("/pose", pose_msg(2.0));
        assert_eq!(bus.flush(), 0);

        ctx.advance_time(Duration::from_millis(50));
        assert_eq!(bus.flush(), 1);
        assert_eq!(*seen.lock().unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_wrong_type_and_topic_not_queued() {
        let bus = SimBus::new(SimContext::new(1), "map");
        let seen = recorder(&bus, "/pose", SubscribeOptions::default());
        assert_eq!(bus.inject("/other", pose_msg(1.0)), 0);
        assert_eq!(
            bus.inject("/pose", Message::Path(Default::default())),
            0
        );
        bus.flush();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_full_drop_rate_loses_everything() {
        let bus = SimBus::new(SimContext::new(1), "map");
        let seen = recorder(&bus, "/pose", SubscribeOptions::default());
        bus.set_drop_rate(1.0);
        bus.inject("/pose", pose_msg(1.0));
        bus.flush();
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(bus.stats().dropped, 1);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let bus = SimBus::new(SimContext::new(1), "map");
        let id = bus
            .subscribe(
                "/pose",
                MessageKind::PoseStamped,
                SubscribeOptions::default(),
                Box::new(|_| {}),
            )
            .unwrap();
        assert_eq!(bus.topic_subscribers("/pose"), 1);
        bus.unsubscribe(id);
        assert_eq!(bus.topic_subscribers("/pose"), 0);
        assert_eq!(bus.inject("/pose", pose_msg(0.0)), 0);
    }

    #[test]
    fn test_frame_subscription_gets_latest_then_updates() {
        let bus = SimBus::new(SimContext::new(1), "map");
        bus.set_transform("base_link", &Isometry3::translation(1.0, 0.0, 0.0));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = bus.subscribe_frame(
            "base_link",
            Box::new(move |tf| sink.lock().unwrap().push(tf.transform.translation.x)),
        );
        bus.set_transform("base_link", &Isometry3::translation(2.0, 0.0, 0.0));
        bus.set_transform("lidar", &Isometry3::translation(9.0, 0.0, 0.0));
        assert_eq!(*seen.lock().unwrap(), vec![1.0, 2.0]);

        bus.unsubscribe_frame(id);
        assert_eq!(bus.frame_subscribers(), 0);
    }

    #[test]
    fn test_publish_records_outbox() {
        let bus = SimBus::new(SimContext::new(1), "map");
        let msg = PoseStamped {
            header: Header::new("map"),
            pose: Pose::default(),
        };
        bus.publish("/vr/head", Message::PoseStamped(msg)).unwrap();
        assert_eq!(bus.published_count("/vr/head"), 1);
        assert_eq!(bus.outbox()[0].0, "/vr/head");
    }
}
