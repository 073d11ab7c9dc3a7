//! Topic and transform transport abstractions for XRView.

use crate::error::EnvError;
use crate::msgs::{Message, MessageKind, TransformStamped};
use crate::types::{SubscribeOptions, SubscriptionId};

/// Callback invoked for every delivered topic message.
pub type MessageHandler = Box<dyn FnMut(&Message) + Send>;

/// Callback invoked for every transform update of a subscribed frame.
pub type TransformHandler = Box<dyn FnMut(&TransformStamped) + Send>;

/// Abstraction for the robot bridge's topic interface.
///
/// # Implementations
///
/// - **Production**: a websocket bridge client (outside this workspace)
/// - **Simulation**: `SimBus`, an in-memory router with queue-depth-1 semantics
///
/// # Delivery
///
/// ```text
/// Robot                     Bridge                     XRView
///   |                          |                          |
///   |-- publish(/points) ----->|                          |
///   |                          |-- [throttle/queue=1] --->|
///   |                          |                          |-- handler(&msg)
/// ```
///
/// Handlers run to completion before the next delivery and never interleave
/// with a render tick.
pub trait TopicTransport: Send + Sync + 'static {
    /// Subscribes a handler to a topic.
    ///
    /// # Arguments
    /// * `topic` - Topic name (e.g. `/map`)
    /// * `kind` - Expected message type; other payloads are not delivered
    /// * `options` - Compression, throttle and queue depth
    /// * `handler` - Callback owning whatever state it writes into
    fn subscribe(
        &self,
        topic: &str,
        kind: MessageKind,
        options: SubscribeOptions,
        handler: MessageHandler,
    ) -> Result<SubscriptionId, EnvError>;

    /// Removes a subscription. Unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId);

    /// Publishes a message on a topic.
    fn publish(&self, topic: &str, message: Message) -> Result<(), EnvError>;
}

/// Abstraction for the transform tree client.
///
/// Unknown frame names are not an error: the handler is simply never called.
pub trait TransformSource: Send + Sync + 'static {
    /// Starts delivering transforms of `frame_id` relative to the fixed frame.
    fn subscribe_frame(&self, frame_id: &str, handler: TransformHandler) -> SubscriptionId;

    /// Stops a frame subscription. Unknown ids are ignored.
    fn unsubscribe_frame(&self, id: SubscriptionId);
}
