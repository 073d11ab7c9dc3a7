//! Robot model follower.
//!
//! Joint angles arrive on one or more JointState topics; each declared
//! joint eases toward its latest angle every render tick. The model root
//! follows the base frame through the transform cache.

use std::collections::BTreeMap;
use std::sync::Arc;

use nalgebra::Isometry3;
use tracing::trace;
use xrview_env::msgs::JointState;
use xrview_env::{EnvError, Message, MessageKind, SubscribeOptions, TopicTransport};

use crate::config::RobotConfig;
use crate::pose::{SmoothedScalar, DEFAULT_BLEND};
use crate::scene::{lock, shared, Shared};
use crate::subscription::TopicSubscription;
use crate::xrview_tf::{FrameTracker, TransformCache};

/// Joint angles and base pose of one robot model.
#[derive(Debug)]
pub struct RobotModel {
    joints: BTreeMap<String, SmoothedScalar>,
    base: FrameTracker,
    base_pose: Isometry3<f64>,
    unknown_joints: u64,
}

impl RobotModel {
    /// Creates a model that animates only the listed joints.
    pub fn new<S: AsRef<str>>(joint_names: &[S], base: FrameTracker) -> Self {
        let joints = joint_names
            .iter()
            .map(|name| (name.as_ref().to_string(), SmoothedScalar::new(DEFAULT_BLEND)))
            .collect();
        Self {
            joints,
            base,
            base_pose: Isometry3::identity(),
            unknown_joints: 0,
        }
    }

    pub fn on_joint_state(&mut self, msg: &JointState) {
        for (name, position) in msg.name.iter().zip(&msg.position) {
            match self.joints.get_mut(name) {
                Some(joint) => joint.set_target(*position),
                None => {
                    self.unknown_joints += 1;
                    trace!(joint = %name, "Joint not in model");
                }
            }
        }
    }

    pub fn tick(&mut self) {
        for joint in self.joints.values_mut() {
            joint.tick();
        }
        self.base_pose = self.base.pose();
    }

    /// Rendered angle of a joint.
    pub fn joint(&self, name: &str) -> Option<f64> {
        self.joints.get(name).map(SmoothedScalar::rendered)
    }

    pub fn joint_names(&self) -> impl Iterator<Item = &str> {
        self.joints.keys().map(String::as_str)
    }

    pub fn base_pose(&self) -> Isometry3<f64> {
        self.base_pose
    }

    pub fn unknown_joints(&self) -> u64 {
        self.unknown_joints
    }
}

/// A [`RobotModel`] wired to its joint state topics.
#[derive(Debug)]
pub struct RobotFollower {
    model: Shared<RobotModel>,
    _subscriptions: Vec<TopicSubscription>,
}

impl RobotFollower {
    pub fn attach<S: AsRef<str>>(
        transport: Arc<dyn TopicTransport>,
        transforms: &TransformCache,
        config: &RobotConfig,
        joint_names: &[S],
    ) -> Result<Self, EnvError> {
        let model = shared(RobotModel::new(
            joint_names,
            transforms.resolve_pose(&config.base_frame),
        ));

        let mut subscriptions = Vec::with_capacity(config.joint_states_topics.len());
        for topic in &config.joint_states_topics {
            let handler_model = model.clone();
            subscriptions.push(TopicSubscription::subscribe(
                transport.clone(),
                topic,
                MessageKind::JointState,
                SubscribeOptions::default(),
                Box::new(move |msg| {
                    if let Message::JointState(joints) = msg {
                        lock(&handler_model).on_joint_state(joints);
                    }
                }),
            )?);
        }

        Ok(Self {
            model,
            _subscriptions: subscriptions,
        })
    }

    pub fn tick(&self) {
        lock(&self.model).tick();
    }

    pub fn model(&self) -> Shared<RobotModel> {
        self.model.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::LoopbackBus;
    use crate::xrview_tf::TransformCacheConfig;
    use approx::assert_relative_eq;
    use xrview_env::msgs::Header;

    fn joint_state(names: &[&str], positions: &[f64]) -> Message {
        Message::JointState(JointState {
            header: Header::new(""),
            name: names.iter().map(|n| n.to_string()).collect(),
            position: positions.to_vec(),
        })
    }

    #[test]
    fn test_joints_ease_toward_latest_angle() {
        let bus = LoopbackBus::new();
        let cache = TransformCache::new(bus.clone(), TransformCacheConfig::default());
        let follower =
            RobotFollower::attach(bus.clone(), &cache, &RobotConfig::default(), &["shoulder"]).unwrap();

        bus.deliver("/joint_states", joint_state(&["shoulder", "gripper"], &[0.0, 1.0]));
        bus.deliver("/joint_states", joint_state(&["shoulder"], &[1.0]));
        follower.tick();

        let model = follower.model();
        let model = lock(&model);
        assert_relative_eq!(model.joint("shoulder").unwrap(), 0.2, epsilon = 1e-12);
        assert_eq!(model.joint("gripper"), None);
        assert_eq!(model.unknown_joints(), 1);
    }

    #[test]
    fn test_base_follows_transform_cache() {
        let bus = LoopbackBus::new();
        let cache = TransformCache::new(bus.clone(), TransformCacheConfig::default());
        bus.set_transform("base_link", Isometry3::translation(0.0, 3.0, 0.0));
        let follower =
            RobotFollower::attach(bus.clone(), &cache, &RobotConfig::default(), &["shoulder"]).unwrap();
        follower.tick();

        let model = follower.model();
        assert_relative_eq!(lock(&model).base_pose().translation.vector.y, 3.0);
        assert_eq!(cache.consumers("base_link"), 1);

        drop(model);
        drop(follower);
        assert_eq!(cache.consumers("base_link"), 0);
        assert_eq!(bus.topic_subscribers("/joint_states"), 0);
    }
}
